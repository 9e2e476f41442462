//! Convenient re-exports for wiring up a [`crate::sync_engine::SyncEngine`].
pub use crate::{
    backoff::{BackoffConfig, BackoffPolicy},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStateKind},
    clock::{Clock, MonotonicClock},
    error::SyncError,
    http_client::{
        AuthProvider, DefaultEndpointResolver, EndpointResolver, HttpClient, HttpClientConfig,
        HttpResponse, IncomingResponse, OutgoingRequest, RequestHeaders, ReqwestTransport,
        StaticAuthProvider, Transport,
    },
    lock::{ProcessingLock, ProcessingLockConfig},
    metrics::{Metrics, MetricsSnapshot},
    model::{
        FailedOp, IndexEntry, LeaseRecord, OpStatus, OpType, PendingOp, StagedWrite,
        TransactionRecord, TxnState, CURRENT_SCHEMA_VERSION,
    },
    optimistic::{OptimisticEntry, OptimisticStore},
    queue::{PendingQueueService, FAILED_BOX, INDEX_BOX, PENDING_BOX},
    reconciler::{ConflictStrategy, ReconcileOutcome, Reconciler},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper},
    store::{MemoryStore, Store, StoreError},
    sync_engine::{EngineRecoveryReport, SyncEngine, SyncEngineBuilder, SyncEngineConfig},
    transaction::{RecoveryReport, Transaction, TransactionService, TransactionServiceBuilder},
};
