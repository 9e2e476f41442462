//! Durable, append-only pending-operation queue with a sorted FIFO index
//! and a failed-operations archive. Every mutating operation commits
//! through [`TransactionService`] so the pending record, the index, and
//! the failed archive never drift out of sync across a crash.

use crate::error::SyncError;
use crate::model::{FailedOp, IndexEntry, OpStatus, PendingOp, CURRENT_SCHEMA_VERSION};
use crate::store::Store;
use crate::transaction::TransactionService;
use chrono::Utc;
use std::sync::Arc;

pub const PENDING_BOX: &str = "pending_ops";
pub const INDEX_BOX: &str = "pending_ops_index";
pub const FAILED_BOX: &str = "failed_ops";
const INDEX_KEY: &str = "order";

/// Durable pending-op queue. `pending`/`index`/`failed` are the same
/// `Store` instances registered with `transactions` under
/// [`PENDING_BOX`]/[`INDEX_BOX`]/[`FAILED_BOX`], kept here too for
/// read-only access that doesn't need transactional staging.
#[derive(Clone)]
pub struct PendingQueueService {
    pending: Arc<dyn Store>,
    index: Arc<dyn Store>,
    failed: Arc<dyn Store>,
    transactions: TransactionService,
}

impl PendingQueueService {
    pub fn new(
        pending: Arc<dyn Store>,
        index: Arc<dyn Store>,
        failed: Arc<dyn Store>,
        transactions: TransactionService,
    ) -> Self {
        Self { pending, index, failed, transactions }
    }

    /// Durably appends `op` to `pending` and its `(id, created_at)` row to
    /// the sorted `order` index, in one commit.
    pub async fn enqueue(&self, op: PendingOp) -> Result<(), SyncError> {
        let mut index = self.read_index().await?;
        index.push(IndexEntry { id: op.id.clone(), created_at: op.created_at });
        index.sort();

        let mut txn = self.transactions.begin().await?;
        txn.write(PENDING_BOX, &op.id, Some(to_json(&op)?));
        txn.write(INDEX_BOX, INDEX_KEY, Some(to_json(&index)?));
        txn.commit().await
    }

    /// Head of the FIFO index, or `None` if the queue is empty. Self-heals
    /// dangling index rows (an id present in the index but missing from
    /// `pending`) by dropping them and trying the next row.
    pub async fn get_oldest(&self) -> Result<Option<PendingOp>, SyncError> {
        loop {
            let mut index = self.read_index().await?;
            let Some(head) = index.first().cloned() else { return Ok(None) };

            match self.pending.get(&head.id).await.map_err(store_err)? {
                Some(value) => return Ok(Some(from_json(value)?)),
                None => {
                    tracing::warn!(id = %head.id, "queue: dangling index entry, dropping");
                    index.retain(|entry| entry.id != head.id);
                    let mut txn = self.transactions.begin().await?;
                    txn.write(INDEX_BOX, INDEX_KEY, Some(to_json(&index)?));
                    txn.commit().await?;
                }
            }
        }
    }

    /// Removes `id` from `pending` and the index. Idempotent: calling
    /// twice with an already-removed id is a no-op on the second call.
    pub async fn mark_processed(&self, id: &str) -> Result<(), SyncError> {
        let mut index = self.read_index().await?;
        index.retain(|entry| entry.id != id);

        let mut txn = self.transactions.begin().await?;
        txn.write(PENDING_BOX, id, None);
        txn.write(INDEX_BOX, INDEX_KEY, Some(to_json(&index)?));
        txn.commit().await
    }

    /// Moves `id` out of `pending` and into the `failed` archive, removing
    /// it from the index. No-op if `id` is no longer pending.
    pub async fn mark_failed(&self, id: &str, error: String, attempts: u32) -> Result<(), SyncError> {
        let Some(op_value) = self.pending.get(id).await.map_err(store_err)? else {
            return Ok(());
        };
        let operation: PendingOp = from_json(op_value)?;

        let mut index = self.read_index().await?;
        index.retain(|entry| entry.id != id);

        let failed = FailedOp {
            schema_version: CURRENT_SCHEMA_VERSION,
            operation,
            error,
            attempts,
            failed_at: Utc::now(),
        };

        let mut txn = self.transactions.begin().await?;
        txn.write(PENDING_BOX, id, None);
        txn.write(FAILED_BOX, id, Some(to_json(&failed)?));
        txn.write(INDEX_BOX, INDEX_KEY, Some(to_json(&index)?));
        txn.commit().await
    }

    /// Rewrites `pending[op.id]`. `created_at` is immutable so the index
    /// is left untouched.
    pub async fn update(&self, op: &PendingOp) -> Result<(), SyncError> {
        let mut txn = self.transactions.begin().await?;
        txn.write(PENDING_BOX, &op.id, Some(to_json(op)?));
        txn.commit().await
    }

    /// Rebuilds the `order` index from scratch by scanning `pending`. The
    /// index is a cache; this is always safe to call.
    pub async fn rebuild_index(&self) -> Result<(), SyncError> {
        let rows = self.pending.scan_prefix("").await.map_err(store_err)?;
        let mut index = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            let op: PendingOp = from_json(value)?;
            index.push(IndexEntry { id: op.id, created_at: op.created_at });
        }
        index.sort();

        let mut txn = self.transactions.begin().await?;
        txn.write(INDEX_BOX, INDEX_KEY, Some(to_json(&index)?));
        txn.commit().await
    }

    /// Startup recovery: `in_flight` must never survive a restart, since
    /// nothing is left to confirm whether the pre-crash request reached the
    /// server; demote every such record back to `queued`.
    pub async fn recover_in_flight(&self) -> Result<usize, SyncError> {
        let rows = self.pending.scan_prefix("").await.map_err(store_err)?;
        let mut demoted = 0;
        for (_, value) in rows {
            let mut op: PendingOp = from_json(value)?;
            if op.status == OpStatus::InFlight {
                op.status = OpStatus::Queued;
                self.update(&op).await?;
                demoted += 1;
            }
        }
        if demoted > 0 {
            tracing::info!(demoted, "queue: demoted in-flight operations to queued on startup");
        }
        Ok(demoted)
    }

    /// Current number of pending operations, for the queue-depth gauge.
    pub async fn depth(&self) -> Result<u64, SyncError> {
        Ok(self.read_index().await?.len() as u64)
    }

    async fn read_index(&self) -> Result<Vec<IndexEntry>, SyncError> {
        match self.index.get(INDEX_KEY).await.map_err(store_err)? {
            None => Ok(Vec::new()),
            Some(value) => from_json(value),
        }
    }
}

fn store_err(e: crate::store::StoreError) -> SyncError {
    SyncError::Internal { message: e.to_string() }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, SyncError> {
    serde_json::to_value(value).map_err(|e| SyncError::Internal { message: e.to_string() })
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::Internal { message: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OpType;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn queue() -> PendingQueueService {
        let pending = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryStore::new());
        let failed = Arc::new(MemoryStore::new());
        let wal = Arc::new(MemoryStore::new());
        let transactions = TransactionService::builder(wal)
            .with_box(PENDING_BOX, pending.clone())
            .with_box(INDEX_BOX, index.clone())
            .with_box(FAILED_BOX, failed.clone())
            .build();
        PendingQueueService::new(pending, index, failed, transactions)
    }

    fn op(id: &str, created_at: chrono::DateTime<Utc>) -> PendingOp {
        PendingOp::new(id, OpType::Create, "reading", BTreeMap::new(), format!("idem-{id}"), created_at)
    }

    #[tokio::test]
    async fn enqueue_then_get_oldest_roundtrips() {
        let queue = queue();
        let now = Utc::now();
        queue.enqueue(op("o1", now)).await.unwrap();

        let fetched = queue.get_oldest().await.unwrap().unwrap();
        assert_eq!(fetched.id, "o1");
        assert_eq!(fetched.idempotency_key, "idem-o1");
    }

    #[tokio::test]
    async fn fifo_order_by_created_at() {
        let queue = queue();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        queue.enqueue(op("second", t1)).await.unwrap();
        queue.enqueue(op("first", t0)).await.unwrap();

        let head = queue.get_oldest().await.unwrap().unwrap();
        assert_eq!(head.id, "first");
    }

    #[tokio::test]
    async fn mark_processed_removes_from_pending_and_index() {
        let queue = queue();
        let now = Utc::now();
        queue.enqueue(op("o1", now)).await.unwrap();
        queue.mark_processed("o1").await.unwrap();

        assert!(queue.get_oldest().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let queue = queue();
        queue.enqueue(op("o1", Utc::now())).await.unwrap();
        queue.mark_processed("o1").await.unwrap();
        queue.mark_processed("o1").await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_failed_moves_to_archive() {
        let queue = queue();
        queue.enqueue(op("o1", Utc::now())).await.unwrap();
        queue.mark_failed("o1", "boom".into(), 3).await.unwrap();

        assert!(queue.get_oldest().await.unwrap().is_none());
        let archived = queue.failed.get("o1").await.unwrap().unwrap();
        let archived: FailedOp = serde_json::from_value(archived).unwrap();
        assert_eq!(archived.attempts, 3);
        assert_eq!(archived.error, "boom");
    }

    #[tokio::test]
    async fn update_does_not_touch_index() {
        let queue = queue();
        let now = Utc::now();
        let mut enqueued = op("o1", now);
        queue.enqueue(enqueued.clone()).await.unwrap();

        enqueued.attempts = 2;
        queue.update(&enqueued).await.unwrap();

        let fetched = queue.get_oldest().await.unwrap().unwrap();
        assert_eq!(fetched.attempts, 2);
        assert_eq!(fetched.created_at, now);
    }

    #[tokio::test]
    async fn self_heals_dangling_index_entry() {
        let queue = queue();
        let now = Utc::now();
        queue.enqueue(op("o1", now)).await.unwrap();
        // Simulate corruption: delete the pending record directly, leaving
        // the index entry dangling.
        queue.pending.delete("o1").await.unwrap();

        assert!(queue.get_oldest().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rebuild_index_sorts_by_created_at_then_id() {
        let queue = queue();
        let t0 = Utc::now();
        // Enqueue out of order, then corrupt the index directly.
        queue.enqueue(op("b", t0)).await.unwrap();
        queue.enqueue(op("a", t0)).await.unwrap();
        queue.index.put(INDEX_KEY, serde_json::json!([])).await.unwrap();

        queue.rebuild_index().await.unwrap();
        let head = queue.get_oldest().await.unwrap().unwrap();
        assert_eq!(head.id, "a");
    }

    #[tokio::test]
    async fn recover_in_flight_demotes_to_queued() {
        let queue = queue();
        let mut in_flight = op("o1", Utc::now());
        in_flight.status = OpStatus::InFlight;
        queue.enqueue(in_flight).await.unwrap();

        let demoted = queue.recover_in_flight().await.unwrap();
        assert_eq!(demoted, 1);

        let fetched = queue.get_oldest().await.unwrap().unwrap();
        assert_eq!(fetched.status, OpStatus::Queued);
    }
}
