//! In-memory registry of optimistic UI transactions: the host applies a
//! state change before server confirmation and registers a rollback
//! action here; the engine calls `commit`/`rollback` once the real
//! outcome is known. Entirely process-local — nothing here is durable,
//! and nothing here needs to be: a crash before commit/rollback simply
//! leaves the host's optimistic UI state un-reconciled until the next
//! tick re-processes the same (durable) pending op.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type SuccessCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;
type RollbackFn = Arc<dyn Fn(&JsonValue) + Send + Sync>;

/// One registered optimistic update, keyed by an opaque `token` (the host
/// typically uses the owning `PendingOp::id`).
#[derive(Clone)]
pub struct OptimisticEntry {
    pub original_snapshot: JsonValue,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
    pub rollback_fn: RollbackFn,
}

/// In-memory `token -> OptimisticEntry` registry. Callbacks are invoked
/// synchronously and must be idempotent: the engine may re-emit
/// commit/rollback at retry boundaries.
#[derive(Clone, Default)]
pub struct OptimisticStore {
    entries: Arc<Mutex<HashMap<String, OptimisticEntry>>>,
}

impl OptimisticStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        token: impl Into<String>,
        original_snapshot: JsonValue,
        rollback_fn: RollbackFn,
        on_success: Option<SuccessCallback>,
        on_error: Option<ErrorCallback>,
    ) {
        let entry = OptimisticEntry { original_snapshot, on_success, on_error, rollback_fn };
        self.entries
            .lock()
            .expect("optimistic store mutex poisoned")
            .insert(token.into(), entry);
    }

    /// Removes the entry and fires `on_success`. A no-op (not an error) if
    /// the token is unknown — commit may be called after a prior commit on
    /// retry boundaries.
    pub fn commit(&self, token: &str) {
        let entry = self.entries.lock().expect("optimistic store mutex poisoned").remove(token);
        if let Some(entry) = entry {
            if let Some(on_success) = entry.on_success {
                on_success();
            }
        }
    }

    /// Removes the entry, invoking `rollback_fn` with the original
    /// snapshot, then `on_error`. A no-op if the token is unknown.
    pub fn rollback(&self, token: &str, error_message: &str) {
        let entry = self.entries.lock().expect("optimistic store mutex poisoned").remove(token);
        if let Some(entry) = entry {
            (entry.rollback_fn)(&entry.original_snapshot);
            if let Some(on_error) = entry.on_error {
                on_error(error_message);
            }
        }
    }

    /// Rolls back every registered entry, in arbitrary order. Used when
    /// the breaker trips catastrophically or the host is shutting down.
    pub fn rollback_all(&self, error_message: &str) {
        let drained: Vec<(String, OptimisticEntry)> =
            self.entries.lock().expect("optimistic store mutex poisoned").drain().collect();
        for (_, entry) in drained {
            (entry.rollback_fn)(&entry.original_snapshot);
            if let Some(on_error) = entry.on_error {
                on_error(error_message);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("optimistic store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn commit_fires_on_success_and_removes_entry() {
        let store = OptimisticStore::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        store.register(
            "t1",
            serde_json::json!({"name": "old"}),
            Arc::new(|_snapshot| {}),
            Some(Arc::new(move || fired_clone.store(true, Ordering::SeqCst))),
            None,
        );

        store.commit("t1");
        assert!(fired.load(Ordering::SeqCst));
        assert!(store.is_empty());
    }

    #[test]
    fn rollback_restores_snapshot_via_rollback_fn_then_on_error() {
        let store = OptimisticStore::new();
        let restored = Arc::new(Mutex::new(None));
        let restored_clone = restored.clone();
        let error_seen = Arc::new(Mutex::new(None));
        let error_seen_clone = error_seen.clone();

        store.register(
            "t1",
            serde_json::json!({"name": "old"}),
            Arc::new(move |snapshot| *restored_clone.lock().unwrap() = Some(snapshot.clone())),
            None,
            Some(Arc::new(move |msg: &str| *error_seen_clone.lock().unwrap() = Some(msg.to_string()))),
        );

        store.rollback("t1", "network down");
        assert_eq!(*restored.lock().unwrap(), Some(serde_json::json!({"name": "old"})));
        assert_eq!(error_seen.lock().unwrap().as_deref(), Some("network down"));
        assert!(store.is_empty());
    }

    #[test]
    fn commit_on_unknown_token_is_a_no_op() {
        let store = OptimisticStore::new();
        store.commit("missing");
    }

    #[test]
    fn rollback_all_rolls_back_every_entry() {
        let store = OptimisticStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let count_clone = count.clone();
            store.register(
                format!("t{i}"),
                serde_json::json!(i),
                Arc::new(move |_| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
                None,
                None,
            );
        }

        store.rollback_all("shutdown");
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(store.is_empty());
    }
}
