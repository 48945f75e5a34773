//! Health & Watchdog (`spec.md` §4.10 component C10): in-memory counters
//! per worker/router, thresholded into a `HealthStatus`, with a periodic
//! watchdog that reacts to `CRITICAL`.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, warn};

const STUCK_THREADS_CRITICAL: u32 = 3;
const POOL_EXHAUSTIONS_CRITICAL: u32 = 5;
const CONSECUTIVE_FAILURES_DEGRADED: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Thread-safe counters for one worker or router instance.
#[derive(Debug)]
pub struct HealthCounters {
    last_success_epoch_ms: AtomicI64,
    consecutive_failures: AtomicU32,
    stuck_threads: AtomicU32,
    pool_exhaustions: AtomicU32,
}

impl Default for HealthCounters {
    fn default() -> Self {
        Self {
            last_success_epoch_ms: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
            stuck_threads: AtomicU32::new(0),
            pool_exhaustions: AtomicU32::new(0),
        }
    }
}

impl HealthCounters {
    pub fn record_success(&self, at: DateTime<Utc>) {
        self.last_success_epoch_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stuck_thread(&self) {
        self.stuck_threads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_exhaustion(&self) {
        self.pool_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_success_epoch_ms.load(Ordering::Relaxed);
        if ms == 0 {
            None
        } else {
            DateTime::from_timestamp_millis(ms)
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn stuck_threads(&self) -> u32 {
        self.stuck_threads.load(Ordering::Relaxed)
    }

    pub fn pool_exhaustions(&self) -> u32 {
        self.pool_exhaustions.load(Ordering::Relaxed)
    }

    /// `spec.md` §4.10 thresholded state.
    pub fn status(&self) -> HealthStatus {
        if self.stuck_threads() >= STUCK_THREADS_CRITICAL
            || self.pool_exhaustions() >= POOL_EXHAUSTIONS_CRITICAL
        {
            HealthStatus::Critical
        } else if self.consecutive_failures() >= CONSECUTIVE_FAILURES_DEGRADED {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Invoked when the watchdog observes `CRITICAL`. The default recovery
/// action stops the worker and lets the external supervisor restart it
/// (`spec.md` §4.10).
pub type RecoveryCallback = Arc<dyn Fn() + Send + Sync>;

/// Periodic task that polls [`HealthCounters`] and reacts to threshold
/// crossings.
pub struct Watchdog {
    counters: Arc<HealthCounters>,
    interval: Duration,
    on_critical: Mutex<Option<RecoveryCallback>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("interval", &self.interval)
            .field("status", &self.counters.status())
            .finish()
    }
}

impl Watchdog {
    pub fn new(counters: Arc<HealthCounters>, interval: Duration) -> Self {
        Self {
            counters,
            interval,
            on_critical: Mutex::new(None),
        }
    }

    pub async fn set_recovery_callback(&self, callback: RecoveryCallback) {
        *self.on_critical.lock().await = Some(callback);
    }

    /// Runs until `stop` is triggered; intended to be spawned as its own
    /// task.
    pub async fn run(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.counters.status() {
                        HealthStatus::Critical => {
                            error!(
                                stuck_threads = self.counters.stuck_threads(),
                                pool_exhaustions = self.counters.pool_exhaustions(),
                                "health status CRITICAL; invoking recovery callback"
                            );
                            if let Some(cb) = self.on_critical.lock().await.as_ref() {
                                cb();
                            }
                        }
                        HealthStatus::Degraded => {
                            warn!(
                                consecutive_failures = self.counters.consecutive_failures(),
                                "health status DEGRADED"
                            );
                        }
                        HealthStatus::Healthy => {}
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_by_default() {
        let counters = HealthCounters::default();
        assert_eq!(counters.status(), HealthStatus::Healthy);
    }

    #[test]
    fn three_stuck_threads_is_critical() {
        let counters = HealthCounters::default();
        counters.record_stuck_thread();
        counters.record_stuck_thread();
        assert_eq!(counters.status(), HealthStatus::Healthy);
        counters.record_stuck_thread();
        assert_eq!(counters.status(), HealthStatus::Critical);
    }

    #[test]
    fn ten_consecutive_failures_is_degraded_not_critical() {
        let counters = HealthCounters::default();
        for _ in 0..10 {
            counters.record_failure();
        }
        assert_eq!(counters.status(), HealthStatus::Degraded);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let counters = HealthCounters::default();
        for _ in 0..5 {
            counters.record_failure();
        }
        counters.record_success(Utc::now());
        assert_eq!(counters.consecutive_failures(), 0);
        assert!(counters.last_success().is_some());
    }

    #[test]
    fn five_pool_exhaustions_is_critical() {
        let counters = HealthCounters::default();
        for _ in 0..5 {
            counters.record_pool_exhaustion();
        }
        assert_eq!(counters.status(), HealthStatus::Critical);
    }
}
