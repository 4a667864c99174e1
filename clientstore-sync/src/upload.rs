//! Batch uploads of local files into a client's storage folder.
//!
//! Items are uploaded one at a time in input order. A failing item never
//! aborts the batch: "already exists" answers are logged and skipped, every
//! other error is collected next to the item that caused it. Nothing here
//! retries; callers decide whether to re-run a batch.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use clientstore_common::keys::{
    build_client_prefix, digits_only, guess_content_type, join_key, normalize_key,
    sanitize_relative_path, split_parent,
};
use clientstore_common::{list_all, ErrorKind, StorageBackend, StorageError, UploadSource};

use crate::progress::{self, ProgressSink};

pub const PDF_MIME: &str = "application/pdf";

/// A local file and where it sits under the chosen root (forward slashes,
/// no `..`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub local_path: PathBuf,
    pub relative_path: String,
}

impl UploadItem {
    pub fn new(local_path: impl Into<PathBuf>, relative_path: &str) -> Self {
        Self {
            local_path: local_path.into(),
            relative_path: sanitize_relative_path(relative_path),
        }
    }
}

/// Who the batch belongs to; fed to the remote path builder.
#[derive(Debug, Clone, Default)]
pub struct RemoteKeyContext {
    pub tax_id_digits: String,
    pub subfolder: Option<String>,
    pub client_id: Option<u64>,
    pub org_id: Option<String>,
    pub company_name: Option<String>,
}

impl RemoteKeyContext {
    pub fn new(tax_id: &str) -> Self {
        Self {
            tax_id_digits: digits_only(tax_id),
            ..Self::default()
        }
    }
}

/// Maps `(context, relative_path)` to a remote key.
pub type RemotePathBuilder = dyn Fn(&RemoteKeyContext, &str) -> String + Send + Sync;

/// `{client prefix}/{subfolder}/{relative}`. The client prefix needs both
/// an org id and a company name; otherwise the tax-id digits stand in.
pub fn default_remote_key(ctx: &RemoteKeyContext, relative_path: &str) -> String {
    let root = match (&ctx.org_id, &ctx.company_name) {
        (Some(org), Some(name)) => {
            build_client_prefix(org, &ctx.tax_id_digits, name, ctx.client_id)
        }
        _ => ctx.tax_id_digits.clone(),
    };
    let subfolder = ctx
        .subfolder
        .as_deref()
        .map(sanitize_relative_path)
        .unwrap_or_default();
    normalize_key(&join_key(&[
        root,
        subfolder,
        sanitize_relative_path(relative_path),
    ]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentTypePolicy {
    /// Same type for every item.
    Fixed(String),
    /// Guess per item from the key's extension.
    Inferred,
}

impl Default for ContentTypePolicy {
    fn default() -> Self {
        ContentTypePolicy::Fixed(PDF_MIME.to_string())
    }
}

#[derive(Debug)]
pub struct UploadFailure {
    pub item: UploadItem,
    pub error: StorageError,
}

impl UploadFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Aggregate result of one batch. Duplicate skips count toward neither
/// `ok_count` nor `failures`.
#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub ok_count: usize,
    pub skipped: usize,
    pub failures: Vec<UploadFailure>,
}

impl UploadOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Upload `items` in order through `backend`.
///
/// `progress` is told about each item before it is sent.
pub async fn upload_items(
    backend: &dyn StorageBackend,
    items: &[UploadItem],
    ctx: &RemoteKeyContext,
    build_key: &RemotePathBuilder,
    content_type: &ContentTypePolicy,
    progress: Option<&dyn ProgressSink>,
) -> UploadOutcome {
    let mut outcome = UploadOutcome::default();
    let total = items.len() as u64;

    for (idx, item) in items.iter().enumerate() {
        progress::report(progress, idx as u64 + 1, Some(total), item.relative_path.clone());

        let remote_key = build_key(ctx, &item.relative_path);
        let ct = match content_type {
            ContentTypePolicy::Fixed(ct) => ct.clone(),
            ContentTypePolicy::Inferred => guess_content_type(&remote_key, None),
        };

        let result = backend
            .upload(
                &remote_key,
                UploadSource::Path(item.local_path.clone()),
                Some(&ct),
                true,
            )
            .await;

        match result {
            Ok(stored) => {
                debug!(key = %stored, path = %item.local_path.display(), "Uploaded");
                outcome.ok_count += 1;
            }
            Err(e) if e.is_duplicate() => {
                info!(key = %remote_key, error = %e, "Object already exists, skipping");
                outcome.skipped += 1;
            }
            Err(e) => {
                warn!(key = %remote_key, path = %item.local_path.display(), error = %e, "Upload failed");
                outcome.failures.push(UploadFailure {
                    item: item.clone(),
                    error: e,
                });
            }
        }
    }

    info!(
        ok = outcome.ok_count,
        skipped = outcome.skipped,
        failed = outcome.failures.len(),
        bucket = %backend.bucket(),
        "Upload batch complete"
    );
    outcome
}

/// Fail with [`StorageError::AlreadyExists`] if `key` is already present.
///
/// Lists every page of the key's parent and compares both the entry name
/// and its full path against the normalized key.
pub async fn ensure_storage_object_absent(
    backend: &dyn StorageBackend,
    key: &str,
) -> Result<(), StorageError> {
    let key = normalize_key(key);
    let (parent, name) = split_parent(&key);
    let entries = list_all(backend, parent).await?;
    let clash = entries
        .iter()
        .any(|e| !e.is_folder() && (e.name == name || normalize_key(&e.full_path) == key));
    if clash {
        return Err(StorageError::AlreadyExists(key));
    }
    Ok(())
}

// ── Local sources ────────────────────────────────────────────────────────────

/// Walk `root` and build one item per regular file.
///
/// Symlinks are not followed. Names with control characters are skipped.
pub fn collect_tree(root: &Path) -> Vec<UploadItem> {
    let mut items = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| match e {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(error = %err, "Failed to read entry while walking upload root");
                None
            }
        })
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");

        if relative.chars().any(|c| c.is_control()) {
            debug!(path = %path.display(), "Skipping file with invalid name");
            continue;
        }

        let item = UploadItem::new(path, &relative);
        if item.relative_path.is_empty() {
            continue;
        }
        items.push(item);
    }

    items
}

/// Items for an explicit list of files: each lands at its bare file name.
pub fn items_from_files(paths: &[PathBuf]) -> Vec<UploadItem> {
    paths
        .iter()
        .filter_map(|p| {
            let name = p.file_name()?.to_string_lossy().to_string();
            Some(UploadItem::new(p.clone(), &name))
        })
        .collect()
}
