//! Prefix-wide deletion and placeholder folders.
//!
//! The store only knows flat keys, so "delete a folder" means listing every
//! descendant one level at a time and deleting each object. Purges are
//! best-effort: individual delete failures are counted, not raised.

use bytes::Bytes;
use tracing::{debug, info, warn};

use clientstore_common::keys::{join_key, normalize_path};
use clientstore_common::{list_all, ListOptions, StorageBackend, StorageError, UploadSource};

use crate::progress::{self, ProgressSink};

/// Listing recursion limit. Real client trees are a handful of levels deep.
pub const MAX_LISTING_DEPTH: usize = 64;

pub const PLACEHOLDER_NAME: &str = ".keep";
const PLACEHOLDER_CONTENT: &[u8] = b"\n";
const PLACEHOLDER_CONTENT_TYPE: &str = "text/plain";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.removed + self.failed
    }
}

/// Every object key under `root`, depth-first, children in name order.
///
/// Keys are returned exactly as listed, so they can be handed back to
/// `delete` unchanged.
pub async fn gather_all_paths(
    backend: &dyn StorageBackend,
    root: &str,
) -> Result<Vec<String>, StorageError> {
    let root = normalize_path(root);
    let mut paths = Vec::new();
    // (prefix, depth); reversed pushes keep name order on pop.
    let mut stack = vec![(root, 0usize)];

    while let Some((prefix, depth)) = stack.pop() {
        let entries = list_all(backend, &prefix).await?;
        let mut folders = Vec::new();

        for entry in entries {
            let path = join_key(&[prefix.as_str(), entry.name.as_str()]);
            if entry.is_folder() {
                if depth + 1 >= MAX_LISTING_DEPTH {
                    warn!(prefix = %path, depth = depth + 1, "Listing depth limit reached, not descending");
                    continue;
                }
                folders.push(path);
            } else {
                paths.push(path);
            }
        }

        for folder in folders.into_iter().rev() {
            stack.push((folder, depth + 1));
        }
    }

    Ok(paths)
}

/// Delete every object under `root`.
///
/// Fails only when the tree cannot be listed. Delete failures, whether the
/// store refuses or the request errors, are counted in `failed`.
pub async fn remove_prefix(
    backend: &dyn StorageBackend,
    root: &str,
    progress: Option<&dyn ProgressSink>,
) -> Result<PurgeReport, StorageError> {
    let paths = gather_all_paths(backend, root).await?;
    let total = paths.len() as u64;
    let mut report = PurgeReport::default();

    for (idx, path) in paths.iter().enumerate() {
        progress::report(progress, idx as u64 + 1, Some(total), path.clone());
        match backend.delete(path).await {
            Ok(true) => report.removed += 1,
            Ok(false) => {
                warn!(key = %path, "Storage refused delete");
                report.failed += 1;
            }
            Err(e) => {
                warn!(key = %path, error = %e, "Delete failed");
                report.failed += 1;
            }
        }
    }

    info!(
        prefix = %root,
        removed = report.removed,
        failed = report.failed,
        "Prefix purge complete"
    );
    Ok(report)
}

/// Make sure each `prefix/name` folder shows up in listings by uploading a
/// one-byte `.keep` into the empty ones. Returns how many were created.
pub async fn ensure_mandatory_subfolders(
    backend: &dyn StorageBackend,
    prefix: &str,
    required: &[String],
) -> Result<usize, StorageError> {
    let mut created = 0;

    for name in required {
        let folder = normalize_path(&join_key(&[prefix, name.as_str()]));
        let existing = backend.list(&folder, ListOptions { limit: 1, offset: 0 }).await?;
        if !existing.is_empty() {
            debug!(folder = %folder, "Folder already present");
            continue;
        }

        let key = join_key(&[folder.as_str(), PLACEHOLDER_NAME]);
        backend
            .upload(
                &key,
                UploadSource::Bytes(Bytes::from_static(PLACEHOLDER_CONTENT)),
                Some(PLACEHOLDER_CONTENT_TYPE),
                true,
            )
            .await?;
        info!(folder = %folder, "Created placeholder folder");
        created += 1;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::directory::DirectoryAdapter;
    use crate::backend::memory::MemoryBackend;

    fn tree() -> MemoryBackend {
        MemoryBackend::with_objects(&[
            "org/cli/A/1.pdf",
            "org/cli/A/2.pdf",
            "org/cli/B/3.pdf",
            "org/cli/B/4.pdf",
            "org/other/keep.pdf",
        ])
    }

    #[tokio::test]
    async fn test_gather_all_paths() {
        let backend = tree();
        let paths = gather_all_paths(&backend, "org/cli").await.unwrap();
        assert_eq!(
            paths,
            vec!["org/cli/A/1.pdf", "org/cli/A/2.pdf", "org/cli/B/3.pdf", "org/cli/B/4.pdf"]
        );
    }

    #[tokio::test]
    async fn test_remove_prefix_all_succeed() {
        let backend = tree();
        let report = remove_prefix(&backend, "org/cli", None).await.unwrap();
        assert_eq!(report, PurgeReport { removed: 4, failed: 0 });
        assert_eq!(backend.keys(), vec!["org/other/keep.pdf"]);
    }

    #[tokio::test]
    async fn test_remove_prefix_partial_failure() {
        let backend = tree();
        backend.reject_delete("org/cli/B/3.pdf");
        let report = remove_prefix(&backend, "org/cli", None).await.unwrap();
        assert_eq!(report.removed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total(), 4);
    }

    #[tokio::test]
    async fn test_gather_pages_through_large_folders() {
        let keys: Vec<String> = (0..1500).map(|i| format!("big/f{:05}.pdf", i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let backend = MemoryBackend::with_objects(&refs);
        let paths = gather_all_paths(&backend, "big").await.unwrap();
        assert_eq!(paths.len(), 1500);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let deep: Vec<String> = (0..MAX_LISTING_DEPTH + 5).map(|i| format!("d{}", i)).collect();
        let key = format!("{}/x.pdf", deep.join("/"));
        let backend = MemoryBackend::with_objects(&[key.as_str(), "d0/top.pdf"]);
        let paths = gather_all_paths(&backend, "").await.unwrap();
        assert_eq!(paths, vec!["d0/top.pdf"]);
    }

    #[tokio::test]
    async fn test_purge_descends_into_accented_folders() {
        let backend = MemoryBackend::with_objects(&[
            "org/cli/Relatórios/a.pdf",
            "org/cli/Relatórios/Ação.pdf",
            "org/cli/b.pdf",
        ]);

        let paths = gather_all_paths(&backend, "org/cli").await.unwrap();
        assert_eq!(
            paths,
            vec!["org/cli/b.pdf", "org/cli/Relatórios/Ação.pdf", "org/cli/Relatórios/a.pdf"]
        );

        let report = remove_prefix(&backend, "org/cli", None).await.unwrap();
        assert_eq!(report, PurgeReport { removed: 3, failed: 0 });
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_purge_accented_folder_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("b/org/cli/Relatórios");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("Ação.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("b/org/cli/top.pdf"), b"y").unwrap();
        let backend = DirectoryAdapter::new(dir.path(), "b");

        let report = remove_prefix(&backend, "org/cli", None).await.unwrap();
        assert_eq!(report, PurgeReport { removed: 2, failed: 0 });
        assert!(!folder.join("Ação.pdf").exists());
        assert!(!dir.path().join("b/org/cli/top.pdf").exists());
    }

    #[tokio::test]
    async fn test_ensure_accented_subfolder_keeps_name() {
        let backend = MemoryBackend::new();
        let required = vec!["Relatórios".to_string()];

        let created = ensure_mandatory_subfolders(&backend, "org/cli", &required).await.unwrap();
        assert_eq!(created, 1);
        assert_eq!(backend.keys(), vec!["org/cli/Relatórios/.keep"]);

        let created = ensure_mandatory_subfolders(&backend, "org/cli", &required).await.unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn test_ensure_mandatory_subfolders_idempotent() {
        let backend = MemoryBackend::with_objects(&["org/cli/GERAL/a.pdf"]);
        let required = vec!["GERAL".to_string(), "Contratos".to_string(), "Fiscal".to_string()];

        let created = ensure_mandatory_subfolders(&backend, "org/cli", &required).await.unwrap();
        assert_eq!(created, 2);
        let uploads_after_first = backend.upload_calls().len();
        assert_eq!(uploads_after_first, 2);
        assert!(backend.keys().contains(&"org/cli/Contratos/.keep".to_string()));

        let created = ensure_mandatory_subfolders(&backend, "org/cli", &required).await.unwrap();
        assert_eq!(created, 0);
        assert_eq!(backend.upload_calls().len(), uploads_after_first);
    }
}
