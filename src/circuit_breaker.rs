//! Circuit breaker guarding the remote endpoint.
//!
//! Tracks failures in a rolling time window; once the count within the
//! window reaches the threshold the breaker trips open and fails fast until
//! a cooldown elapses, then allows one probe through in `half-open`.

use crate::clock::{Clock, MonotonicClock};
use crate::metrics::Metrics;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
        }
    }
}

struct Inner {
    state: CircuitStateKind,
    rolling_failures: VecDeque<u64>,
    open_until_millis: Option<u64>,
}

/// Fail-fast gate tracking rolling failures; trip -> cooldown -> half-open.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitStateKind::Closed,
                rolling_failures: VecDeque::new(),
                open_until_millis: None,
            })),
            metrics: None,
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Feed `breaker_trips` into `metrics` every time this breaker opens.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// `state == open && now < open_until`.
    pub fn is_tripped(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        inner.state == CircuitStateKind::Open
    }

    /// Time remaining until the breaker may probe again, `None` unless open.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        if inner.state != CircuitStateKind::Open {
            return None;
        }
        let open_until = inner.open_until_millis?;
        let now = self.now_millis();
        Some(Duration::from_millis(open_until.saturating_sub(now)))
    }

    /// Clears the failure window in closed/half-open; ignored while open
    /// (only state expiry allows reset while open).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitStateKind::HalfOpen => {
                inner.state = CircuitStateKind::Closed;
                inner.rolling_failures.clear();
                inner.open_until_millis = None;
                tracing::info!("circuit breaker -> closed");
            }
            CircuitStateKind::Closed => {
                inner.rolling_failures.clear();
            }
            CircuitStateKind::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        let now = self.now_millis();

        match inner.state {
            CircuitStateKind::HalfOpen => {
                self.trip(&mut inner, now);
                tracing::warn!("circuit breaker: half-open probe failed -> open");
            }
            CircuitStateKind::Closed => {
                inner.rolling_failures.push_back(now);
                self.evict_outside_window(&mut inner, now);
                if inner.rolling_failures.len() >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                    tracing::error!(
                        failures = inner.rolling_failures.len(),
                        threshold = self.config.failure_threshold,
                        "circuit breaker -> open"
                    );
                }
            }
            CircuitStateKind::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner, now: u64) {
        inner.state = CircuitStateKind::Open;
        inner.open_until_millis = Some(now + self.config.cooldown.as_millis() as u64);
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_trip();
        }
    }

    fn evict_outside_window(&self, inner: &mut Inner, now: u64) {
        let window_ms = self.config.window.as_millis() as u64;
        while let Some(&oldest) = inner.rolling_failures.front() {
            if now.saturating_sub(oldest) > window_ms {
                inner.rolling_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state != CircuitStateKind::Open {
            return;
        }
        let Some(open_until) = inner.open_until_millis else { return };
        if self.now_millis() >= open_until {
            inner.state = CircuitStateKind::HalfOpen;
            tracing::info!("circuit breaker -> half-open");
        }
    }

    pub fn state(&self) -> CircuitStateKind {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
