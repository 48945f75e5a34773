//! Circuit breaker around the queue adapter's send/receive path.
//!
//! Not named directly in `spec.md`, but `QueuePoolExhaustion` (§7) and the
//! connection-pool acquisition timeout it describes (§5) are exactly what a
//! circuit breaker protects against: once Postgres/PGMQ calls start failing
//! repeatedly, trip to `Open` and fail fast instead of piling up more
//! connection attempts against an already-struggling pool.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl From<CircuitState> for u8 {
    fn from(s: CircuitState) -> Self {
        match s {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    pub consecutive_failures: u32,
    pub half_open_calls: u32,
    pub current_state: CircuitState,
}

/// Closed → Open (on `failure_threshold` consecutive failures) → HalfOpen
/// (once `timeout` has elapsed) → Closed (on `success_threshold` successes
/// in HalfOpen, or back to Open on any HalfOpen failure).
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_calls: AtomicU32,
    opened_at_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed.into()),
            consecutive_failures: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Returns whether the next call should proceed, transitioning
    /// Open -> HalfOpen first if the recovery timeout has elapsed.
    pub fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                if self.now_ms().saturating_sub(opened_at) >= self.config.timeout.as_millis() as u64
                {
                    self.state
                        .store(CircuitState::HalfOpen.into(), Ordering::Release);
                    self.half_open_calls.store(0, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let calls = self.half_open_calls.fetch_add(1, Ordering::AcqRel) + 1;
                if calls >= self.config.success_threshold {
                    self.state
                        .store(CircuitState::Closed.into(), Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.half_open_calls.store(0, Ordering::Release);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    fn open(&self) {
        self.state
            .store(CircuitState::Open.into(), Ordering::Release);
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn force_open(&self) {
        self.open();
    }

    pub fn force_closed(&self) {
        self.state
            .store(CircuitState::Closed.into(), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            half_open_calls: self.half_open_calls.load(Ordering::Acquire),
            current_state: self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, timeout: Duration, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold, timeout, success_threshold }
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new("test".into(), CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test".into(), config(3, Duration::from_secs(30), 2));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn success_resets_failure_count_in_closed() {
        let cb = CircuitBreaker::new("test".into(), config(5, Duration::from_secs(30), 2));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.metrics().consecutive_failures, 0);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("test".into(), config(1, Duration::ZERO, 2));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test".into(), config(1, Duration::ZERO, 2));
        cb.record_failure();
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn force_operations() {
        let cb = CircuitBreaker::new("test".into(), CircuitBreakerConfig::default());
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.force_closed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
