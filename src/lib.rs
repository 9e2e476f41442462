#![forbid(unsafe_code)]

//! # sync-engine
//!
//! Offline-first sync engine: a durable, crash-safe write pipeline that
//! records intended state mutations locally, replays them against a remote
//! HTTP API under adverse network conditions, and reconciles server-side
//! conflicts so the local store and the server converge.
//!
//! The crate is agnostic to what the mutations mean — entities are opaque
//! `{id, type, payload}` records (see [`model::PendingOp`]). Everything
//! domain-specific (UI, business schemas, ML inference, notification
//! delivery) lives in the host application.
//!
//! ## Components
//!
//! - [`backoff`] — exponential backoff with jitter and server-hint honoring.
//! - [`circuit_breaker`] — closed/open/half-open breaker guarding the remote endpoint.
//! - [`metrics`] — counters, gauges, latency percentiles, derived health score.
//! - [`http_client`] — header injection, status-to-error mapping, token refresh, `Retry-After` parsing.
//! - [`lock`] — heartbeated processing lease with stale takeover.
//! - [`queue`] — durable pending-operation queue with a FIFO index and failed-ops archive.
//! - [`transaction`] — write-ahead-log-backed multi-key atomic commits with restart recovery.
//! - [`optimistic`] — in-memory registry of pending UI transactions with commit/rollback hooks.
//! - [`reconciler`] — per-operation-kind 409 conflict resolution.
//! - [`sync_engine`] — orchestrates all of the above into a single processing tick.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use sync_engine::backoff::{BackoffConfig, BackoffPolicy};
//! use sync_engine::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use sync_engine::http_client::{
//!     DefaultEndpointResolver, HttpClient, HttpClientConfig, StaticAuthProvider,
//! };
//! use sync_engine::lock::{ProcessingLock, ProcessingLockConfig};
//! use sync_engine::metrics::Metrics;
//! use sync_engine::optimistic::OptimisticStore;
//! use sync_engine::queue::{PendingQueueService, FAILED_BOX, INDEX_BOX, PENDING_BOX};
//! use sync_engine::reconciler::Reconciler;
//! use sync_engine::store::MemoryStore;
//! use sync_engine::sync_engine::{SyncEngine, SyncEngineConfig};
//! use sync_engine::transaction::TransactionService;
//!
//! # async fn wiring() {
//! let (pending, index, failed, wal, lease) = (
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryStore::new()),
//! );
//! let transactions = TransactionService::builder(wal)
//!     .with_box(PENDING_BOX, pending.clone())
//!     .with_box(INDEX_BOX, index.clone())
//!     .with_box(FAILED_BOX, failed.clone())
//!     .build();
//! let queue = PendingQueueService::new(pending, index, failed, transactions.clone());
//! let metrics = Arc::new(Metrics::new());
//! let lock = ProcessingLock::new(lease, ProcessingLockConfig::default(), metrics.clone());
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default()).with_metrics(metrics.clone());
//! let backoff = BackoffPolicy::new(BackoffConfig::default());
//! let auth = Arc::new(StaticAuthProvider::new("token"));
//! let http = HttpClient::with_reqwest(
//!     HttpClientConfig { base_url: "https://api.example.com".into(), ..Default::default() },
//!     auth,
//! );
//! let resolver = Arc::new(DefaultEndpointResolver);
//! let reconciler = Reconciler::new(http.clone(), resolver.clone());
//! let optimistic = OptimisticStore::new();
//!
//! let engine = SyncEngine::builder(
//!     queue, lock, breaker, backoff, http, resolver, reconciler, optimistic, metrics,
//!     transactions, SyncEngineConfig { runner_id: "runner-1".into(), ..Default::default() },
//! )
//! .build();
//!
//! engine.recover().await.expect("startup recovery");
//! engine.tick().await.expect("one processing pass");
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod http_client;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod optimistic;
pub mod queue;
pub mod reconciler;
pub mod sleeper;
pub mod store;
pub mod sync_engine;
pub mod transaction;

pub mod prelude;

pub use error::SyncError;
pub use model::{FailedOp, IndexEntry, LeaseRecord, OpStatus, OpType, PendingOp, TransactionRecord};
pub use sync_engine::{SyncEngine, SyncEngineConfig};
