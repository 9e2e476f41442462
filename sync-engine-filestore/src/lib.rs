//! File-backed [`Store`] implementation. One JSON file per logical store
//! (`pending_ops`, `pending_ops_index`, `failed_ops`, `sync_lock`,
//! `sync_wal`) — construct one [`FileStore`] per file. Every mutation
//! serializes the entire in-memory map and writes it via a temp-file then
//! atomic rename, so a crash mid-write leaves either the old file or the
//! new one intact, never a half-written one.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sync_engine::store::{Store, StoreError};
use tokio::sync::Mutex;

/// A [`Store`] backed by a single JSON file holding the whole key-value map.
///
/// Reads never touch disk — the map is loaded once at [`FileStore::open`]
/// and kept resident; every write re-serializes the full map to a sibling
/// `.tmp` file and renames it over the original, which on POSIX filesystems
/// is atomic with respect to concurrent readers opening the path.
#[derive(Clone)]
pub struct FileStore {
    path: PathBuf,
    data: Arc<Mutex<BTreeMap<String, JsonValue>>>,
}

impl FileStore {
    /// Loads `path` if it exists (an empty/absent file starts as an empty
    /// map), creating parent directories as needed.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, data: Arc::new(Mutex::new(data)) })
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        let file_name = temp.file_name().map(|n| n.to_owned()).unwrap_or_default();
        temp.set_file_name(format!("{}.tmp", file_name.to_string_lossy()));
        temp
    }

    /// Serializes the current map to the temp path then renames it over
    /// `self.path`. Caller must hold the map lock for the duration.
    async fn persist(&self, map: &BTreeMap<String, JsonValue>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(map).map_err(|e| StoreError::Serde(e.to_string()))?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes).await.map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.insert(key.to_string(), value);
        self.persist(&data).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        if data.remove(key).is_some() {
            self.persist(&data).await?;
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>, StoreError> {
        let data = self.data.lock().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<JsonValue>,
        new: Option<JsonValue>,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        let current = data.get(key).cloned();
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                data.insert(key.to_string(), value);
            }
            None => {
                data.remove(key);
            }
        }
        self.persist(&data).await?;
        Ok(true)
    }
}
