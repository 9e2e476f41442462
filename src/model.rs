//! Data model: the records persisted in the five logical stores.
//!
//! All records carry `schema_version` so a host can upgrade on next write
//! without a migration pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The kind of mutation a [`PendingOp`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Create,
    Update,
    Delete,
}

/// Lifecycle status of a [`PendingOp`] while it sits in the pending store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Queued,
    InFlight,
    Failed,
}

/// A durable record of an intended server mutation awaiting transmission.
///
/// `id` is globally unique and stable across retries; the engine never
/// regenerates it. `idempotency_key` is what the server deduplicates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOp {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub op_type: OpType,
    pub entity_type: String,
    pub payload: BTreeMap<String, JsonValue>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: OpStatus,
    pub last_error: Option<String>,
}

fn current_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl PendingOp {
    /// Construct a freshly-enqueued op: `queued`, zero attempts, eligible now.
    pub fn new(
        id: impl Into<String>,
        op_type: OpType,
        entity_type: impl Into<String>,
        payload: BTreeMap<String, JsonValue>,
        idempotency_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            id: id.into(),
            op_type,
            entity_type: entity_type.into(),
            payload,
            idempotency_key: idempotency_key.into(),
            created_at: now,
            attempts: 0,
            next_attempt_at: now,
            status: OpStatus::Queued,
            last_error: None,
        }
    }

    /// Whether this op is eligible for processing given the current time.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }
}

/// A row in the `order` index: `(id, created_at)`, sorted by `created_at`
/// then `id` for FIFO tie-breaking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.created_at.cmp(&other.created_at).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An entry in the `failed_ops` archive: a permanently-failed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOp {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    pub operation: PendingOp,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// State of a staged transaction in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Pending,
    Committed,
    Applied,
    Failed,
}

/// A single staged write within a transaction: a target store, key, and
/// value. An empty value (`None`) means delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedWrite {
    pub store: String,
    pub key: String,
    pub value: Option<JsonValue>,
}

/// A write-ahead log record covering one multi-key atomic commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    pub txn_id: String,
    pub state: TxnState,
    pub ops: Vec<StagedWrite>,
    pub started_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

/// The single-writer lease record held in the `sync_lock` store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    pub runner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}
