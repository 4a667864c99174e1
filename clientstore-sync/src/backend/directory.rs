//! Local directory backend adapter.
//!
//! Mirrors the object-store contract on a plain directory tree, for offline
//! use and tests. Uses atomic write (temp file → fsync → rename) so a
//! reader never sees a partial object.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use clientstore_common::backend::{checked_key, checked_path, ListOptions, ListingEntry, UploadSource};
use clientstore_common::keys::{normalize_path, sanitize_relative_path};
use clientstore_common::{StorageBackend, StorageError};

pub struct DirectoryAdapter {
    base_path: PathBuf,
    bucket: String,
}

impl DirectoryAdapter {
    /// Objects of `bucket` live under `base_path/bucket/`.
    pub fn new(base_path: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            bucket: bucket.into(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        // Prevent path traversal
        let key = sanitize_relative_path(key);
        self.base_path.join(&self.bucket).join(key)
    }
}

#[async_trait]
impl StorageBackend for DirectoryAdapter {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        _content_type: Option<&str>,
        upsert: bool,
    ) -> Result<String, StorageError> {
        let key = checked_key(key)?;
        let dest = self.full_path(&key);

        if !upsert && tokio::fs::try_exists(&dest).await? {
            return Err(StorageError::AlreadyExists(key));
        }

        let data = source.into_bytes().await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = dest.with_file_name(format!(
            ".{}.tmp",
            dest.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));
        tokio::fs::write(&tmp_path, &data).await?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &dest).await?;

        debug!(key = %key, "Directory upload complete");
        Ok(key)
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let key = checked_path(key)?;
        let src = self.full_path(&key);
        if !src.is_file() {
            return Err(StorageError::NotFound(key));
        }
        Ok(Bytes::from(tokio::fs::read(&src).await?))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let key = checked_path(key)?;
        let path = self.full_path(&key);
        if !path.is_file() {
            debug!(key = %key, "Directory delete: no such object");
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await?;
        debug!(key = %key, "Directory delete complete");
        Ok(true)
    }

    async fn list(
        &self,
        prefix: &str,
        options: ListOptions,
    ) -> Result<Vec<ListingEntry>, StorageError> {
        let prefix = normalize_path(prefix);
        let dir = self.full_path(&prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut rows = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            let meta = entry.metadata().await?;
            let metadata = if meta.is_dir() {
                None
            } else {
                Some(serde_json::json!({ "size": meta.len() }))
            };
            rows.push((name, metadata));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(rows
            .into_iter()
            .skip(options.offset as usize)
            .take(options.limit as usize)
            .map(|(name, metadata)| ListingEntry::new(&prefix, &name, metadata))
            .collect())
    }
}
