//! Orchestrates every other component into the single processing tick
//! described in the original design: pop the oldest ready op, gate on the
//! circuit breaker, send it, then reconcile/retry/archive based on the
//! outcome. [`SyncEngine`] owns no store itself — it coordinates the
//! services that do, borrowing references rather than holding any
//! persistent state of its own — so it is a plain struct built once at
//! startup from host-supplied config, composing independently-owned
//! collaborators rather than holding any of its own mutable global state.

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::SyncError;
use crate::http_client::{EndpointResolver, HttpClient, RequestHeaders};
use crate::lock::ProcessingLock;
use crate::metrics::Metrics;
use crate::model::{OpStatus, PendingOp};
use crate::optimistic::OptimisticStore;
use crate::queue::PendingQueueService;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::transaction::{RecoveryReport, TransactionService};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tunables that belong to the engine itself rather than any one
/// component it coordinates.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Identity this process presents to [`ProcessingLock`]. Must be
    /// stable for the process's lifetime and unique among concurrent
    /// runners.
    pub runner_id: String,
    /// Heartbeat cadence while this runner holds the lock. Must stay
    /// strictly under a third of the lock's stale window, or the holder
    /// risks losing the lease to a takeover while still alive.
    pub heartbeat_interval: Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self { runner_id: "default-runner".to_string(), heartbeat_interval: Duration::from_secs(60) }
    }
}

/// Combined startup-recovery report: WAL replay plus in-flight demotion.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineRecoveryReport {
    pub wal: RecoveryReport,
    pub demoted_in_flight: usize,
}

/// Ties together every component into the single processing loop. Cheap
/// to clone (every field is itself an `Arc`-backed handle or
/// plain config), so a host can hand the same engine to multiple tasks —
/// though only one call to [`SyncEngine::tick`] should be in flight at a
/// time per `runner_id`.
#[derive(Clone)]
pub struct SyncEngine {
    queue: PendingQueueService,
    lock: ProcessingLock,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
    http: HttpClient,
    resolver: Arc<dyn EndpointResolver>,
    reconciler: Reconciler,
    optimistic: OptimisticStore,
    metrics: Arc<Metrics>,
    transactions: TransactionService,
    sleeper: Arc<dyn Sleeper>,
    config: SyncEngineConfig,
    stop_flag: Arc<AtomicBool>,
}

pub struct SyncEngineBuilder {
    queue: PendingQueueService,
    lock: ProcessingLock,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
    http: HttpClient,
    resolver: Arc<dyn EndpointResolver>,
    reconciler: Reconciler,
    optimistic: OptimisticStore,
    metrics: Arc<Metrics>,
    transactions: TransactionService,
    sleeper: Arc<dyn Sleeper>,
    config: SyncEngineConfig,
}

impl SyncEngineBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: PendingQueueService,
        lock: ProcessingLock,
        breaker: CircuitBreaker,
        backoff: BackoffPolicy,
        http: HttpClient,
        resolver: Arc<dyn EndpointResolver>,
        reconciler: Reconciler,
        optimistic: OptimisticStore,
        metrics: Arc<Metrics>,
        transactions: TransactionService,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            queue,
            lock,
            breaker,
            backoff,
            http,
            resolver,
            reconciler,
            optimistic,
            metrics,
            transactions,
            sleeper: Arc::new(TokioSleeper),
            config,
        }
    }

    /// Override the sleeper (deterministic tests use
    /// [`crate::sleeper::InstantSleeper`] or
    /// [`crate::sleeper::TrackingSleeper`]).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> SyncEngine {
        SyncEngine {
            queue: self.queue,
            lock: self.lock,
            breaker: self.breaker,
            backoff: self.backoff,
            http: self.http,
            resolver: self.resolver,
            reconciler: self.reconciler,
            optimistic: self.optimistic,
            metrics: self.metrics,
            transactions: self.transactions,
            sleeper: self.sleeper,
            config: self.config,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SyncEngine {
    pub fn builder(
        queue: PendingQueueService,
        lock: ProcessingLock,
        breaker: CircuitBreaker,
        backoff: BackoffPolicy,
        http: HttpClient,
        resolver: Arc<dyn EndpointResolver>,
        reconciler: Reconciler,
        optimistic: OptimisticStore,
        metrics: Arc<Metrics>,
        transactions: TransactionService,
        config: SyncEngineConfig,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder::new(
            queue, lock, breaker, backoff, http, resolver, reconciler, optimistic, metrics,
            transactions, config,
        )
    }

    /// Durable enqueue plus the enqueued-counter and queue-depth gauge.
    pub async fn enqueue(&self, op: PendingOp) -> Result<(), SyncError> {
        self.queue.enqueue(op).await?;
        self.metrics.record_enqueued();
        self.metrics.set_queue_depth(self.queue.depth().await?);
        Ok(())
    }

    /// Registers a pre-applied optimistic UI update; `token` is usually
    /// the owning `PendingOp::id`. See [`OptimisticStore::register`].
    #[allow(clippy::too_many_arguments)]
    pub fn register_optimistic(
        &self,
        token: impl Into<String>,
        original_snapshot: JsonValue,
        rollback_fn: Arc<dyn Fn(&JsonValue) + Send + Sync>,
        on_success: Option<Arc<dyn Fn() + Send + Sync>>,
        on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ) {
        self.optimistic.register(token, original_snapshot, rollback_fn, on_success, on_error);
    }

    /// Startup recovery: replays/discards WAL entries, then demotes any
    /// `in_flight` pending op back to `queued`. Must run before the first
    /// `tick()`.
    pub async fn recover(&self) -> Result<EngineRecoveryReport, SyncError> {
        let wal = self.transactions.recover().await?;
        let demoted_in_flight = self.queue.recover_in_flight().await?;
        Ok(EngineRecoveryReport { wal, demoted_in_flight })
    }

    /// A snapshot of every counter/gauge/derived metric, no I/O.
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.summary()
    }

    /// Requests that an in-progress `tick()` stop after its current
    /// in-flight request completes, rather than draining the whole queue.
    /// Checked once per loop iteration.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Drives one processing pass: breaker check, lock acquire, drain the
    /// queue FIFO-head-first until empty/not-ready/stopped, release the
    /// lock. The host schedules calls to this (app foreground,
    /// connectivity change, timer) — the engine never schedules its own
    /// wake-ups.
    pub async fn tick(&self) -> Result<(), SyncError> {
        if self.breaker.is_tripped() {
            if let Some(remaining) = self.breaker.cooldown_remaining() {
                tracing::debug!(?remaining, "tick: breaker tripped, sleeping out cooldown");
                self.sleeper.sleep(remaining).await;
            }
            return Ok(());
        }

        if !self.lock.try_acquire(&self.config.runner_id).await? {
            tracing::debug!(runner_id = %self.config.runner_id, "tick: lock held elsewhere, skipping");
            return Ok(());
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        let heartbeat = self.spawn_heartbeat();

        let result = self.drain().await;

        heartbeat.abort();
        self.lock.release(&self.config.runner_id).await?;
        result
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let lock = self.lock.clone();
        let runner_id = self.config.runner_id.clone();
        let interval = self.config.heartbeat_interval;
        let sleeper = self.sleeper.clone();
        tokio::spawn(async move {
            loop {
                sleeper.sleep(interval).await;
                if let Err(err) = lock.update_heartbeat(&runner_id).await {
                    tracing::warn!(%err, "heartbeat: update failed");
                }
            }
        })
    }

    async fn drain(&self) -> Result<(), SyncError> {
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                tracing::info!("tick: stop requested, exiting after last in-flight op");
                break;
            }

            let Some(mut op) = self.queue.get_oldest().await? else { break };
            if !op.is_ready(Utc::now()) {
                // FIFO: if the head isn't ready, nothing behind it is either.
                break;
            }

            op.status = OpStatus::InFlight;
            self.queue.update(&op).await?;

            let trace_id = uuid::Uuid::now_v7().to_string();
            let method = self.resolver.method_for(op.op_type);
            let path = self.resolver.path_for(&op);
            let body: JsonValue =
                op.payload.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<serde_json::Map<_, _>>().into();
            let headers = RequestHeaders {
                idempotency_key: Some(op.idempotency_key.clone()),
                trace_id: Some(trace_id),
            };

            match self.http.request(method, &path, Some(body), headers).await {
                Ok(response) => self.on_success(&op, response.latency).await?,
                Err(err @ SyncError::Conflict { .. }) => self.on_conflict(&mut op, err).await?,
                Err(err) => self.on_failure(&mut op, err).await?,
            }

            self.metrics.set_queue_depth(self.queue.depth().await?);
        }
        Ok(())
    }

    async fn on_success(&self, op: &PendingOp, latency: Duration) -> Result<(), SyncError> {
        self.metrics.record_success(latency);
        self.breaker.record_success();
        self.optimistic.commit(&op.id);
        self.queue.mark_processed(&op.id).await
    }

    /// Resolves as if the send had succeeded, but without a latency
    /// sample of its own — the reconciler's GET already produced one.
    async fn on_resolved_without_resend(&self, op: &PendingOp) -> Result<(), SyncError> {
        self.metrics.record_processed();
        self.breaker.record_success();
        self.optimistic.commit(&op.id);
        self.queue.mark_processed(&op.id).await
    }

    async fn on_conflict(&self, op: &mut PendingOp, err: SyncError) -> Result<(), SyncError> {
        let SyncError::Conflict { conflict_type, body, .. } = &err else { unreachable!() };
        let conflicting_resource_id = body.get("resource_id").and_then(|v| v.as_str());
        match self.reconciler.reconcile(op, conflict_type, conflicting_resource_id).await {
            ReconcileOutcome::Resolved => {
                self.metrics.record_conflict_resolved();
                self.on_resolved_without_resend(op).await
            }
            ReconcileOutcome::RetryWithMergedPayload => {
                self.metrics.record_conflict_resolved();
                self.queue.update(op).await
            }
            ReconcileOutcome::GiveUp => self.fail_permanently(op, err).await,
        }
    }

    async fn on_failure(&self, op: &mut PendingOp, err: SyncError) -> Result<(), SyncError> {
        if err.is_network_class() {
            self.metrics.record_network_error();
        }

        if err.is_retryable() && self.backoff.should_retry(op.attempts + 1) {
            op.attempts += 1;
            let delay = self.backoff.compute_delay(op.attempts as i64, err.retry_after());
            op.next_attempt_at = Utc::now() + to_chrono_duration(delay);
            op.status = OpStatus::Queued;
            op.last_error = Some(err.summary());
            self.queue.update(op).await?;
            self.metrics.record_retry();
            self.breaker.record_failure();
            Ok(())
        } else {
            self.fail_permanently(op, err).await
        }
    }

    async fn fail_permanently(&self, op: &PendingOp, err: SyncError) -> Result<(), SyncError> {
        self.metrics.record_failed();
        self.optimistic.rollback(&op.id, &err.summary());
        if err.is_network_class() {
            self.breaker.record_failure();
        }
        self.queue.mark_failed(&op.id, err.summary(), op.attempts).await
    }
}

fn to_chrono_duration(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::http_client::{
        DefaultEndpointResolver, HttpClientConfig, IncomingResponse, StaticAuthProvider, Transport,
    };
    use crate::lock::ProcessingLockConfig;
    use crate::model::OpType;
    use crate::queue::{FAILED_BOX, INDEX_BOX, PENDING_BOX};
    use crate::sleeper::InstantSleeper;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct ScriptedTransport {
        responses: Arc<StdMutex<VecDeque<IncomingResponse>>>,
    }

    impl ScriptedTransport {
        fn push(&self, response: IncomingResponse) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _request: crate::http_client::OutgoingRequest,
        ) -> Result<IncomingResponse, SyncError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| SyncError::Internal { message: "scripted transport exhausted".into() })
        }
    }

    struct Harness {
        engine: SyncEngine,
        transport: ScriptedTransport,
    }

    fn harness() -> Harness {
        harness_with_backoff(BackoffConfig::default())
    }

    fn harness_with_backoff(backoff_config: BackoffConfig) -> Harness {
        let pending = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryStore::new());
        let failed = Arc::new(MemoryStore::new());
        let wal = Arc::new(MemoryStore::new());
        let lease = Arc::new(MemoryStore::new());

        let transactions = TransactionService::builder(wal)
            .with_box(PENDING_BOX, pending.clone())
            .with_box(INDEX_BOX, index.clone())
            .with_box(FAILED_BOX, failed.clone())
            .build();
        let queue = PendingQueueService::new(pending, index, failed, transactions.clone());
        let metrics = Arc::new(Metrics::new());
        let lock = ProcessingLock::new(lease, ProcessingLockConfig::default(), metrics.clone());
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default()).with_metrics(metrics.clone());
        let backoff = BackoffPolicy::new(backoff_config);

        let transport = ScriptedTransport::default();
        let http = HttpClient::new(
            Arc::new(transport.clone()),
            HttpClientConfig { base_url: "https://api.example.com".into(), ..Default::default() },
            Arc::new(StaticAuthProvider::new("tok")),
        );
        let resolver: Arc<dyn EndpointResolver> = Arc::new(DefaultEndpointResolver);
        let reconciler = Reconciler::new(http.clone(), resolver.clone());
        let optimistic = OptimisticStore::new();

        let config = SyncEngineConfig { runner_id: "runner-a".into(), heartbeat_interval: Duration::from_secs(60) };
        let engine = SyncEngine::builder(
            queue, lock, breaker, backoff, http, resolver, reconciler, optimistic, metrics,
            transactions, config,
        )
        .with_sleeper(Arc::new(InstantSleeper))
        .build();

        Harness { engine, transport }
    }

    fn create_op(id: &str) -> PendingOp {
        let mut payload = BTreeMap::new();
        payload.insert("name".to_string(), serde_json::json!("A"));
        PendingOp::new(id, OpType::Create, "readings", payload, format!("idem-{id}"), Utc::now())
    }

    #[tokio::test]
    async fn happy_path_create_processes_and_records_metrics() {
        let h = harness();
        h.transport.push(IncomingResponse { status: 201, headers: vec![], body: serde_json::json!({}) });

        h.engine.enqueue(create_op("o1")).await.unwrap();
        h.engine.tick().await.unwrap();

        let snapshot = h.engine.metrics();
        assert_eq!(snapshot.operations.processed, 1);
        assert_eq!(snapshot.operations.failed, 0);
        assert_eq!(snapshot.queue.current_depth, 0);
    }

    #[tokio::test]
    async fn retryable_429_schedules_next_attempt_and_leaves_queue_depth() {
        let h = harness();
        h.transport.push(IncomingResponse {
            status: 429,
            headers: vec![("retry-after".to_string(), "60".to_string())],
            body: serde_json::json!({}),
        });

        h.engine.enqueue(create_op("o2")).await.unwrap();
        h.engine.tick().await.unwrap();

        let snapshot = h.engine.metrics();
        assert_eq!(snapshot.operations.retries, 1);
        assert_eq!(snapshot.queue.current_depth, 1);
    }

    #[tokio::test]
    async fn validation_error_archives_as_permanently_failed() {
        let h = harness();
        h.transport.push(IncomingResponse {
            status: 400,
            headers: vec![],
            body: serde_json::json!({"error": "bad", "fields": {"name": "required"}}),
        });

        h.engine.enqueue(create_op("o3")).await.unwrap();
        h.engine.tick().await.unwrap();

        let snapshot = h.engine.metrics();
        assert_eq!(snapshot.operations.failed, 1);
        assert_eq!(snapshot.queue.current_depth, 0);
    }

    #[tokio::test]
    async fn breaker_tripped_short_circuits_without_http_call() {
        // max_attempts: 1 so each 500 exhausts retries immediately and the
        // drain moves on to the next op within the same tick, instead of
        // rescheduling the head and blocking the FIFO on backoff.
        let h = harness_with_backoff(BackoffConfig { max_attempts: 1, ..Default::default() });
        for _ in 0..3 {
            h.transport.push(IncomingResponse { status: 500, headers: vec![], body: serde_json::json!({}) });
        }

        h.engine.enqueue(create_op("o4")).await.unwrap();
        h.engine.enqueue(create_op("o5")).await.unwrap();
        h.engine.enqueue(create_op("o6")).await.unwrap();
        h.engine.tick().await.unwrap();

        assert!(h.engine.breaker.is_tripped());
        let snapshot = h.engine.metrics();
        assert_eq!(snapshot.operations.failed, 3);

        // A further tick must not reach the (now-exhausted) transport.
        h.engine.tick().await.unwrap();
    }

    #[tokio::test]
    async fn not_ready_head_stops_the_drain_without_processing() {
        let h = harness();
        let mut future_op = create_op("o7");
        future_op.next_attempt_at = Utc::now() + chrono::Duration::seconds(60);
        h.engine.enqueue(future_op).await.unwrap();

        h.engine.tick().await.unwrap();

        assert_eq!(h.transport.responses.lock().unwrap().len(), 0);
        let snapshot = h.engine.metrics();
        assert_eq!(snapshot.operations.processed, 0);
        assert_eq!(snapshot.queue.current_depth, 1);
    }

    #[tokio::test]
    async fn recover_demotes_in_flight_and_replays_wal() {
        let h = harness();
        let mut op = create_op("o8");
        op.status = OpStatus::InFlight;
        h.engine.enqueue(op).await.unwrap();

        let report = h.engine.recover().await.unwrap();
        assert_eq!(report.demoted_in_flight, 1);
    }
}
