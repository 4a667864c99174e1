pub mod directory;
#[cfg(test)]
pub(crate) mod memory;
pub mod supabase;

use std::sync::Arc;

use anyhow::Context;
use clientstore_common::StorageBackend;

use crate::config::{BackendKind, SyncConfig};

use self::directory::DirectoryAdapter;
use self::supabase::{SupabaseConfig, SupabaseStorage};

/// Construct the storage adapter named by the configuration.
///
/// One adapter is built per bucket and shared by every component that needs
/// it; nothing here is process-global.
pub fn from_config(config: &SyncConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.backend {
        BackendKind::Supabase => {
            let storage = SupabaseStorage::new(SupabaseConfig {
                base_url: config.storage_url.clone(),
                api_key: config.api_key.clone(),
                bucket: config.bucket.clone(),
            })
            .context("Failed to build storage HTTP client")?;
            Ok(Arc::new(storage))
        }
        BackendKind::Directory => {
            let path = config
                .directory_path
                .clone()
                .context("directory_path is required for the directory backend")?;
            Ok(Arc::new(DirectoryAdapter::new(path, config.bucket.clone())))
        }
    }
}
