//! Write-ahead-log-backed multi-key atomic commits with restart recovery.
//!
//! A [`Transaction`] stages writes against named "boxes" (logical stores
//! registered with the owning [`TransactionService`]) entirely in memory.
//! `commit()` durably flushes the transaction record as `committed` before
//! touching any target store, applies the staged writes, then flushes the
//! record again as `applied`. If the process dies between those two
//! flushes, [`TransactionService::recover`] replays the staged writes on
//! the next startup before any other engine tick runs.

use crate::error::SyncError;
use crate::model::{StagedWrite, TransactionRecord, TxnState, CURRENT_SCHEMA_VERSION};
use crate::store::Store;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Summary of a [`TransactionService::recover`] pass, for startup logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub discarded_pending: usize,
    pub replayed_committed: usize,
}

struct Inner {
    wal: Arc<dyn Store>,
    boxes: HashMap<String, Arc<dyn Store>>,
}

/// Owns the WAL store and the registry of target stores writes may be
/// staged against. Cheap to clone (an `Arc` internally) so a [`Transaction`]
/// can hold its own owned copy across `.await` points.
#[derive(Clone)]
pub struct TransactionService {
    inner: Arc<Inner>,
}

pub struct TransactionServiceBuilder {
    wal: Arc<dyn Store>,
    boxes: HashMap<String, Arc<dyn Store>>,
}

impl TransactionServiceBuilder {
    pub fn new(wal: Arc<dyn Store>) -> Self {
        Self { wal, boxes: HashMap::new() }
    }

    pub fn with_box(mut self, name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.boxes.insert(name.into(), store);
        self
    }

    pub fn build(self) -> TransactionService {
        TransactionService { inner: Arc::new(Inner { wal: self.wal, boxes: self.boxes }) }
    }
}

impl TransactionService {
    pub fn builder(wal: Arc<dyn Store>) -> TransactionServiceBuilder {
        TransactionServiceBuilder::new(wal)
    }

    /// Opens a new transaction, durably persisting its `pending` WAL
    /// record before any write is staged.
    pub async fn begin(&self) -> Result<Transaction, SyncError> {
        let txn_id = uuid::Uuid::now_v7().to_string();
        let record = TransactionRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            txn_id: txn_id.clone(),
            state: TxnState::Pending,
            ops: Vec::new(),
            started_at: Utc::now(),
            committed_at: None,
            applied_at: None,
        };
        self.persist(&record).await?;
        Ok(Transaction { service: self.clone(), record })
    }

    /// Startup recovery: `pending` entries with no effects applied are
    /// discarded (marked `failed`); `committed` entries are replayed then
    /// marked `applied`. `applied`/`failed` entries need no action.
    pub async fn recover(&self) -> Result<RecoveryReport, SyncError> {
        let rows = self
            .inner
            .wal
            .scan_prefix("")
            .await
            .map_err(|e| SyncError::Internal { message: e.to_string() })?;

        let mut report = RecoveryReport::default();
        for (_, value) in rows {
            let mut record: TransactionRecord = serde_json::from_value(value)
                .map_err(|e| SyncError::Internal { message: e.to_string() })?;
            match record.state {
                TxnState::Pending => {
                    record.state = TxnState::Failed;
                    self.persist(&record).await?;
                    report.discarded_pending += 1;
                    tracing::warn!(txn_id = %record.txn_id, "recovery: discarding pending transaction");
                }
                TxnState::Committed => {
                    self.apply(&record.ops).await?;
                    record.state = TxnState::Applied;
                    record.applied_at = Some(Utc::now());
                    self.persist(&record).await?;
                    report.replayed_committed += 1;
                    tracing::info!(txn_id = %record.txn_id, "recovery: replayed committed transaction");
                }
                TxnState::Applied | TxnState::Failed => {}
            }
        }
        Ok(report)
    }

    async fn persist(&self, record: &TransactionRecord) -> Result<(), SyncError> {
        let value = serde_json::to_value(record)
            .map_err(|e| SyncError::Internal { message: e.to_string() })?;
        self.inner
            .wal
            .put(&record.txn_id, value)
            .await
            .map_err(|e| SyncError::Internal { message: e.to_string() })
    }

    async fn apply(&self, ops: &[StagedWrite]) -> Result<(), SyncError> {
        for op in ops {
            let store = self.inner.boxes.get(&op.store).ok_or_else(|| SyncError::Internal {
                message: format!("transaction references unregistered box `{}`", op.store),
            })?;
            match &op.value {
                Some(value) => store
                    .put(&op.key, value.clone())
                    .await
                    .map_err(|e| SyncError::Internal { message: e.to_string() })?,
                None => store
                    .delete(&op.key)
                    .await
                    .map_err(|e| SyncError::Internal { message: e.to_string() })?,
            }
        }
        Ok(())
    }
}

/// A transaction in progress: writes are staged in memory until `commit`.
pub struct Transaction {
    service: TransactionService,
    record: TransactionRecord,
}

impl Transaction {
    pub fn txn_id(&self) -> &str {
        &self.record.txn_id
    }

    /// Stages a write; `value = None` means delete. Not durable until
    /// `commit()` is called.
    pub fn write(&mut self, box_name: impl Into<String>, key: impl Into<String>, value: Option<JsonValue>) {
        self.record.ops.push(StagedWrite { store: box_name.into(), key: key.into(), value });
    }

    /// Flushes the record as `committed`, applies every staged write, then
    /// flushes the record again as `applied`.
    pub async fn commit(mut self) -> Result<(), SyncError> {
        self.record.state = TxnState::Committed;
        self.record.committed_at = Some(Utc::now());
        self.service.persist(&self.record).await?;

        self.service.apply(&self.record.ops).await?;

        self.record.state = TxnState::Applied;
        self.record.applied_at = Some(Utc::now());
        self.service.persist(&self.record).await?;
        Ok(())
    }

    /// Marks the WAL record `failed` without applying any staged write.
    pub async fn rollback(mut self) -> Result<(), SyncError> {
        self.record.state = TxnState::Failed;
        self.service.persist(&self.record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn service_with_box() -> (TransactionService, Arc<MemoryStore>, Arc<MemoryStore>) {
        let wal = Arc::new(MemoryStore::new());
        let target = Arc::new(MemoryStore::new());
        let service =
            TransactionService::builder(wal.clone()).with_box("things", target.clone()).build();
        (service, wal, target)
    }

    #[tokio::test]
    async fn commit_applies_staged_writes() {
        let (service, _wal, target) = service_with_box();
        let mut txn = service.begin().await.unwrap();
        txn.write("things", "a", Some(json!(1)));
        txn.write("things", "b", Some(json!(2)));
        txn.commit().await.unwrap();

        assert_eq!(target.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(target.get("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn commit_with_none_value_deletes() {
        let (service, _wal, target) = service_with_box();
        target.put("a", json!(1)).await.unwrap();

        let mut txn = service.begin().await.unwrap();
        txn.write("things", "a", None);
        txn.commit().await.unwrap();

        assert_eq!(target.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rollback_does_not_apply_writes() {
        let (service, _wal, target) = service_with_box();
        let mut txn = service.begin().await.unwrap();
        txn.write("things", "a", Some(json!(1)));
        txn.rollback().await.unwrap();

        assert_eq!(target.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn recover_discards_pending_without_applying() {
        let (service, wal, target) = service_with_box();
        // Simulate a crash right after begin(): the WAL has a pending
        // record but no committed flush ever happened.
        let mut txn = service.begin().await.unwrap();
        txn.write("things", "a", Some(json!(1)));
        drop(txn); // crash before commit or rollback

        let report = service.recover().await.unwrap();
        assert_eq!(report.discarded_pending, 1);
        assert_eq!(report.replayed_committed, 0);
        assert_eq!(target.get("a").await.unwrap(), None);

        let rows = wal.scan_prefix("").await.unwrap();
        assert_eq!(rows.len(), 1);
        let record: TransactionRecord = serde_json::from_value(rows[0].1.clone()).unwrap();
        assert_eq!(record.state, TxnState::Failed);
    }

    #[tokio::test]
    async fn recover_replays_committed_before_applied() {
        let (service, wal, target) = service_with_box();

        // Hand-craft a `committed` WAL record as if the process died
        // between the committed-flush and applying the writes.
        let txn_id = "01J0000000000000000000TEST".to_string();
        let record = TransactionRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            txn_id: txn_id.clone(),
            state: TxnState::Committed,
            ops: vec![StagedWrite { store: "things".into(), key: "a".into(), value: Some(json!(42)) }],
            started_at: Utc::now(),
            committed_at: Some(Utc::now()),
            applied_at: None,
        };
        wal.put(&txn_id, serde_json::to_value(&record).unwrap()).await.unwrap();

        let report = service.recover().await.unwrap();
        assert_eq!(report.replayed_committed, 1);
        assert_eq!(target.get("a").await.unwrap(), Some(json!(42)));

        let stored: TransactionRecord =
            serde_json::from_value(wal.get(&txn_id).await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.state, TxnState::Applied);
    }

    #[tokio::test]
    async fn recover_is_a_no_op_for_applied_and_failed_entries() {
        let (service, wal, _target) = service_with_box();
        for (id, state) in [("applied-1", TxnState::Applied), ("failed-1", TxnState::Failed)] {
            let record = TransactionRecord {
                schema_version: CURRENT_SCHEMA_VERSION,
                txn_id: id.into(),
                state,
                ops: vec![],
                started_at: Utc::now(),
                committed_at: None,
                applied_at: None,
            };
            wal.put(id, serde_json::to_value(&record).unwrap()).await.unwrap();
        }

        let report = service.recover().await.unwrap();
        assert_eq!(report.discarded_pending, 0);
        assert_eq!(report.replayed_committed, 0);
    }
}
