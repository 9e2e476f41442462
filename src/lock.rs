//! Processing lock: a heartbeated, single-writer lease over the shared
//! lease store, with stale-takeover so a crashed runner cannot wedge the
//! queue forever.

use crate::metrics::Metrics;
use crate::model::{LeaseRecord, CURRENT_SCHEMA_VERSION};
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const LOCK_KEY: &str = "lock";
const ACQUIRE_RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct ProcessingLockConfig {
    pub stale_window: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ProcessingLockConfig {
    fn default() -> Self {
        Self { stale_window: Duration::from_secs(300), heartbeat_interval: Duration::from_secs(60) }
    }
}

/// Single-writer lease over the `sync_lock` store. `try_acquire` is the
/// only operation that can transfer ownership; `update_heartbeat` and
/// `release` are write-through no-ops for any caller that isn't the
/// current holder.
#[derive(Clone)]
pub struct ProcessingLock {
    store: Arc<dyn Store>,
    config: ProcessingLockConfig,
    metrics: Arc<Metrics>,
}

impl ProcessingLock {
    pub fn new(store: Arc<dyn Store>, config: ProcessingLockConfig, metrics: Arc<Metrics>) -> Self {
        Self { store, config, metrics }
    }

    /// Attempts to become (or remain) the lock holder. Bounded retries
    /// absorb a losing race against a concurrent acquirer; the caller
    /// should treat a final `false` as "someone else has it right now".
    pub async fn try_acquire(&self, runner_id: &str) -> Result<bool, crate::error::SyncError> {
        for _ in 0..ACQUIRE_RETRY_ATTEMPTS {
            if self.try_acquire_once(runner_id).await? {
                return Ok(true);
            }
            let current = self.read().await?;
            let held_by_other_and_fresh = match current {
                Some(lease) => lease.runner_id != runner_id && !self.is_stale(&lease),
                None => false,
            };
            if held_by_other_and_fresh {
                return Ok(false);
            }
        }
        Ok(false)
    }

    async fn try_acquire_once(&self, runner_id: &str) -> Result<bool, crate::error::SyncError> {
        let current = self.read().await?;
        let now = Utc::now();

        match &current {
            None => {
                let lease = self.new_lease(runner_id, now);
                self.cas(None, Some(&lease)).await
            }
            Some(lease) if lease.runner_id == runner_id => {
                let refreshed = LeaseRecord { last_heartbeat: now, ..lease.clone() };
                self.cas(Some(lease), Some(&refreshed)).await
            }
            Some(lease) if self.is_stale(lease) => {
                let taken = self.new_lease(runner_id, now);
                let ok = self.cas(Some(lease), Some(&taken)).await?;
                if ok {
                    self.metrics.record_lock_takeover();
                    tracing::warn!(
                        runner_id,
                        previous_holder = %lease.runner_id,
                        "processing lock: stale takeover"
                    );
                }
                Ok(ok)
            }
            Some(_) => Ok(false),
        }
    }

    /// Refreshes the heartbeat if `runner_id` is still the holder;
    /// otherwise does nothing, since only the current holder may
    /// write-through a refresh.
    pub async fn update_heartbeat(&self, runner_id: &str) -> Result<(), crate::error::SyncError> {
        let Some(current) = self.read().await? else { return Ok(()) };
        if current.runner_id != runner_id {
            return Ok(());
        }
        let refreshed = LeaseRecord { last_heartbeat: Utc::now(), ..current.clone() };
        self.cas(Some(&current), Some(&refreshed)).await?;
        Ok(())
    }

    /// Deletes the lease if `runner_id` is still the holder; otherwise
    /// does nothing.
    pub async fn release(&self, runner_id: &str) -> Result<(), crate::error::SyncError> {
        let Some(current) = self.read().await? else { return Ok(()) };
        if current.runner_id != runner_id {
            return Ok(());
        }
        self.cas(Some(&current), None).await?;
        Ok(())
    }

    pub async fn get_lock_holder(&self) -> Result<Option<String>, crate::error::SyncError> {
        Ok(self.read().await?.map(|lease| lease.runner_id))
    }

    fn is_stale(&self, lease: &LeaseRecord) -> bool {
        let age = Utc::now() - lease.last_heartbeat;
        age.to_std().unwrap_or(Duration::ZERO) > self.config.stale_window
    }

    fn new_lease(&self, runner_id: &str, now: chrono::DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            runner_id: runner_id.to_string(),
            acquired_at: now,
            last_heartbeat: now,
        }
    }

    async fn read(&self) -> Result<Option<LeaseRecord>, crate::error::SyncError> {
        let raw = self
            .store
            .get(LOCK_KEY)
            .await
            .map_err(|e| crate::error::SyncError::Internal { message: e.to_string() })?;
        match raw {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| crate::error::SyncError::Internal { message: e.to_string() })
                .map(Some),
        }
    }

    async fn cas(
        &self,
        expected: Option<&LeaseRecord>,
        new: Option<&LeaseRecord>,
    ) -> Result<bool, crate::error::SyncError> {
        let expected_json = expected.map(|l| serde_json::to_value(l).expect("LeaseRecord serializes"));
        let new_json = new.map(|l| serde_json::to_value(l).expect("LeaseRecord serializes"));
        self.store
            .compare_and_swap(LOCK_KEY, expected_json, new_json)
            .await
            .map_err(|e| crate::error::SyncError::Internal { message: e.to_string() })
    }
}
