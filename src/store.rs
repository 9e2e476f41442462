//! Durable key-value storage abstraction.
//!
//! The five logical stores (`pending_ops`, `pending_ops_index`,
//! `failed_ops`, `sync_lock`, `sync_wal`) are all instances of the same
//! [`Store`] trait, namespaced by a string prefix so a single physical
//! backend can host all five. [`MemoryStore`] is the in-process
//! implementation used by tests and by hosts that don't need durability
//! across restarts; the sibling `sync-engine-filestore` crate provides a
//! durable, file-backed implementation.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A durable (or in-memory) key-value store addressed by opaque string keys.
///
/// Implementations must provide per-key atomicity for `put`/`delete`: two
/// concurrent writers to the same key must not interleave partial writes.
/// [`crate::lock::ProcessingLock`] depends on this for its atomic
/// read-modify-write acquire.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError>;
    async fn put(&self, key: &str, value: JsonValue) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All `(key, value)` pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>, StoreError>;

    /// Atomic compare-and-swap: succeeds and writes `new` only if the
    /// current value equals `expected` (`None` means "key absent").
    /// Used by [`crate::lock::ProcessingLock`] to make acquire/heartbeat/
    /// release race-free without a separate locking primitive.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<JsonValue>,
        new: Option<JsonValue>,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// In-process `Store` backed by a `Mutex<BTreeMap>`. Not durable across
/// restarts — intended for tests and hosts without persistence needs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, JsonValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
        self.data.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().await.remove(key);
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
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryStore::new();
        store.put("a", json!({"x": 1})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = MemoryStore::new();
        store.put("a", json!(1)).await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_filters() {
        let store = MemoryStore::new();
        store.put("pending:1", json!(1)).await.unwrap();
        store.put("pending:2", json!(2)).await.unwrap();
        store.put("other:1", json!(3)).await.unwrap();
        let mut results = store.scan_prefix("pending:").await.unwrap();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "pending:1");
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_expected() {
        let store = MemoryStore::new();
        store.put("lock", json!("a")).await.unwrap();
        let ok = store
            .compare_and_swap("lock", Some(json!("b")), Some(json!("c")))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(store.get("lock").await.unwrap(), Some(json!("a")));
    }

    #[tokio::test]
    async fn compare_and_swap_succeeds_on_match() {
        let store = MemoryStore::new();
        let ok = store.compare_and_swap("lock", None, Some(json!("a"))).await.unwrap();
        assert!(ok);
        assert_eq!(store.get("lock").await.unwrap(), Some(json!("a")));
    }
}
