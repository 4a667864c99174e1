//! In-memory backend with fault injection, for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use clientstore_common::backend::{checked_key, checked_path, ListOptions, ListingEntry, UploadSource};
use clientstore_common::keys::{normalize_key, normalize_path};
use clientstore_common::{StorageBackend, StorageError};

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Answer like the store does for an existing object.
    Duplicate,
    /// Fail as if the connection dropped.
    Connection,
}

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
    upload_faults: Mutex<HashMap<String, Fault>>,
    rejected_deletes: Mutex<HashSet<String>>,
    uploads: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed objects under their exact names, as a store would list them.
    pub fn with_objects(keys: &[&str]) -> Self {
        let backend = Self::new();
        {
            let mut objects = backend.objects.lock().unwrap();
            for key in keys {
                objects.insert(normalize_path(key), Bytes::from_static(b"x"));
            }
        }
        backend
    }

    pub fn fail_upload(&self, key: &str, fault: Fault) {
        self.upload_faults.lock().unwrap().insert(normalize_key(key), fault);
    }

    pub fn reject_delete(&self, key: &str) {
        self.rejected_deletes.lock().unwrap().insert(normalize_path(key));
    }

    /// Keys passed to `upload`, in call order.
    pub fn upload_calls(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn bucket(&self) -> &str {
        "memory"
    }

    async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        _content_type: Option<&str>,
        upsert: bool,
    ) -> Result<String, StorageError> {
        let key = checked_key(key)?;
        self.uploads.lock().unwrap().push(key.clone());

        let fault = self.upload_faults.lock().unwrap().get(&key).copied();
        match fault {
            Some(Fault::Duplicate) => {
                return Err(StorageError::Api {
                    status: 409,
                    error: "Duplicate".into(),
                    message: "The resource already exists".into(),
                })
            }
            Some(Fault::Connection) => {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    format!("connection reset by peer while sending {}", key),
                )))
            }
            None => {}
        }

        let data = source.into_bytes().await?;
        let mut objects = self.objects.lock().unwrap();
        if !upsert && objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        objects.insert(key.clone(), data);
        Ok(key)
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let key = checked_path(key)?;
        self.objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let key = checked_path(key)?;
        if self.rejected_deletes.lock().unwrap().contains(&key) {
            return Ok(false);
        }
        Ok(self.objects.lock().unwrap().remove(&key).is_some())
    }

    async fn list(
        &self,
        prefix: &str,
        options: ListOptions,
    ) -> Result<Vec<ListingEntry>, StorageError> {
        let prefix = normalize_path(prefix);
        let objects = self.objects.lock().unwrap();

        // name -> is_folder
        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for key in objects.keys() {
            let rest = if prefix.is_empty() {
                key.as_str()
            } else {
                match key.strip_prefix(&prefix).and_then(|r| r.strip_prefix('/')) {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.insert(dir.to_string(), true);
                }
                None => {
                    children.entry(rest.to_string()).or_insert(false);
                }
            }
        }

        Ok(children
            .into_iter()
            .skip(options.offset as usize)
            .take(options.limit as usize)
            .map(|(name, is_folder)| {
                let metadata = (!is_folder).then(|| serde_json::json!({ "size": 1 }));
                ListingEntry::new(&prefix, &name, metadata)
            })
            .collect())
    }
}
