use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{ApiErrorBody, StorageError};
use crate::keys::{join_key, normalize_key, normalize_path};

/// Default page size for prefix listings.
pub const DEFAULT_LIST_LIMIT: u32 = 1000;

/// Trait implemented by all object-store adapters.
///
/// An adapter is bound to a single bucket and holds nothing but its client
/// handle and configuration, so one instance can be shared across
/// concurrent batches. Upload keys are normalized with accent stripping;
/// every other operation addresses existing objects and only fixes slashes.
///
/// Adapters never retry: transport errors go back to the caller unchanged.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Bucket this adapter is bound to.
    fn bucket(&self) -> &str;

    /// Upload an object. `upsert = true` overwrites an existing object.
    /// Returns the key the store actually recorded.
    async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        content_type: Option<&str>,
        upsert: bool,
    ) -> Result<String, StorageError>;

    /// Fetch the full contents of an object.
    async fn download(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Remove one object. `Ok(false)` means the store answered with an error
    /// payload; transport failures are returned as `Err`.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// List the direct children of `prefix`, ordered by name ascending.
    async fn list(
        &self,
        prefix: &str,
        options: ListOptions,
    ) -> Result<Vec<ListingEntry>, StorageError>;

    /// Download an object into `dest`. Parent directories are created when
    /// `create_parents` is set (it is cleared in storage-only mode).
    async fn download_to(
        &self,
        key: &str,
        dest: &Path,
        create_parents: bool,
    ) -> Result<PathBuf, StorageError> {
        let data = self.download(key).await?;
        if create_parents {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(dest, &data).await?;
        tracing::debug!(key = %key, path = %dest.display(), "Object downloaded to disk");
        Ok(dest.to_path_buf())
    }
}

/// What to upload: an in-memory buffer or a local file read fully into memory.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    Path(PathBuf),
}

impl UploadSource {
    pub async fn into_bytes(self) -> Result<Bytes, StorageError> {
        match self {
            UploadSource::Bytes(b) => Ok(b),
            UploadSource::Path(p) => Ok(Bytes::from(tokio::fs::read(&p).await?)),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(b: Bytes) -> Self {
        UploadSource::Bytes(b)
    }
}

impl From<PathBuf> for UploadSource {
    fn from(p: PathBuf) -> Self {
        UploadSource::Path(p)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub limit: u32,
    pub offset: u32,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

/// One child of a listed prefix.
///
/// The store has no folders: an entry without metadata is taken to be a
/// folder. This is a heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub name: String,
    /// `prefix/name`, normalized.
    pub full_path: String,
    pub metadata: Option<serde_json::Value>,
}

impl ListingEntry {
    pub fn new(prefix: &str, name: &str, metadata: Option<serde_json::Value>) -> Self {
        Self {
            name: name.to_string(),
            full_path: join_key(&[prefix, name]),
            metadata,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.metadata.is_none()
    }
}

/// Raw listing row as the REST API returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawListingEntry {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// A list call answers with either an array of rows or an error object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListResponse {
    Data(Vec<RawListingEntry>),
    Error(ApiErrorBody),
}

impl ListResponse {
    /// Decode a response body into listing entries under `prefix`.
    pub fn decode(status: u16, body: &str, prefix: &str) -> Result<Vec<ListingEntry>, StorageError> {
        let parsed: ListResponse = serde_json::from_str(body)
            .map_err(|e| StorageError::Decode(format!("list response: {}", e)))?;
        match parsed {
            ListResponse::Data(rows) => Ok(rows
                .into_iter()
                .filter(|r| !r.name.is_empty())
                .map(|r| {
                    let metadata = r.metadata.filter(|m| !m.is_null());
                    ListingEntry::new(prefix, &r.name, metadata)
                })
                .collect()),
            ListResponse::Error(body) => Err(StorageError::Api {
                status: body.status_code().unwrap_or(status),
                error: body.error.unwrap_or_default(),
                message: body.message.unwrap_or_default(),
            }),
        }
    }
}

/// Normalize a key for a new upload and reject ones that cannot address an
/// object.
pub fn checked_key(key: &str) -> Result<String, StorageError> {
    reject_unusable(key, normalize_key(key))
}

/// Like [`checked_key`] but for objects that already exist: slashes are
/// fixed, the name is kept as stored.
pub fn checked_path(key: &str) -> Result<String, StorageError> {
    reject_unusable(key, normalize_path(key))
}

fn reject_unusable(raw: &str, normalized: String) -> Result<String, StorageError> {
    if normalized.is_empty() || normalized.contains('\0') {
        return Err(StorageError::InvalidKey(raw.to_string()));
    }
    Ok(normalized)
}

/// Every direct child of `prefix`, requesting further pages while the
/// previous one came back full.
pub async fn list_all(
    backend: &dyn StorageBackend,
    prefix: &str,
) -> Result<Vec<ListingEntry>, StorageError> {
    let mut options = ListOptions::default();
    let mut all = Vec::new();
    loop {
        let page = backend.list(prefix, options).await?;
        let n = page.len();
        all.extend(page);
        if n == 0 || n < options.limit as usize {
            break;
        }
        options.offset += options.limit;
    }
    Ok(all)
}
