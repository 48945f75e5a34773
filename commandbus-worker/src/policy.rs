//! Retry policy (`spec.md` §4.6 "Retry policy"): decides whether a
//! transient failure is retried with backoff or routed to the
//! troubleshooting queue.

use commandbus_core::BackoffSchedule;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: i32,
    backoff: BackoffSchedule,
}

/// What to do after a transient failure at a given attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Extend the message's visibility by this many seconds.
    Backoff(u64),
    /// `attempts >= max_attempts`: route to TSQ with code EXHAUSTED.
    Exhausted,
}

impl RetryPolicy {
    pub fn new(max_attempts: i32, backoff: BackoffSchedule) -> Self {
        Self { max_attempts, backoff }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// `attempt` is the 1-based attempt count already incremented by
    /// `sp_receive_command` for the failing invocation.
    pub fn decide(&self, attempt: i32) -> RetryDecision {
        if attempt >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Backoff(self.backoff.delay_for_attempt(attempt as u32))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_one_exhausts_immediately() {
        let policy = RetryPolicy::new(1, BackoffSchedule(vec![10, 60, 300]));
        assert_eq!(policy.decide(1), RetryDecision::Exhausted);
    }

    #[test]
    fn backs_off_before_exhaustion() {
        let policy = RetryPolicy::new(3, BackoffSchedule(vec![10, 60]));
        assert_eq!(policy.decide(1), RetryDecision::Backoff(10));
        assert_eq!(policy.decide(2), RetryDecision::Backoff(60));
        assert_eq!(policy.decide(3), RetryDecision::Exhausted);
    }
}
