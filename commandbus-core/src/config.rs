//! Layered configuration for the command bus (`spec.md` §6
//! "Environment/configuration").
//!
//! Loaded from an optional TOML base file, then environment variables
//! prefixed `COMMANDBUS_` (double-underscore separated for nesting), via
//! the `config` crate. `dotenvy` is applied by the caller before
//! [`CommandBusConfig::load`] runs so a local `.env` populates the
//! environment layer too.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Retry backoff schedule, expressed as a sequence of delays in seconds
/// (`spec.md` §4.6 "Retry/backoff").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffSchedule(pub Vec<u64>);

impl BackoffSchedule {
    /// Delay before the attempt numbered `attempt` (1-based), clamping to
    /// the last entry once the schedule is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let idx = (attempt.saturating_sub(1)) as usize;
        self.0
            .get(idx)
            .or_else(|| self.0.last())
            .copied()
            .unwrap_or(0)
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self(vec![5, 15, 60, 300, 900])
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_visibility_timeout() -> i32 {
    30
}

fn default_statement_timeout_ms() -> u64 {
    15_000
}

fn default_concurrency() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_pool_min() -> u32 {
    2
}

fn default_pool_max() -> u32 {
    20
}

fn default_router_concurrency() -> usize {
    4
}

/// Full runtime configuration for a command-bus deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBusConfig {
    pub database_url: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff_schedule: BackoffSchedule,

    /// Seconds a read message stays invisible before it is eligible for
    /// redelivery (`spec.md` §4.2 "Visibility Timeout").
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: i32,

    /// Postgres `statement_timeout` applied to handler transactions; must
    /// stay below `visibility_timeout * 1000` ms or a handler that times
    /// out could still be marked visible again mid-execution.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,

    /// Worker concurrency (`spec.md` §5 "Concurrency & Resource Model").
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_pool_min")]
    pub pool_min: u32,

    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    /// Reply-router concurrency (`spec.md` §4.9, §5); separate from
    /// `concurrency` because the router and worker pull from different
    /// queues and compete for the same connection pool.
    #[serde(default = "default_router_concurrency")]
    pub router_concurrency: usize,
}

impl CommandBusConfig {
    /// Load from an optional TOML file, overridden by `COMMANDBUS_*`
    /// environment variables, then validate.
    pub fn load(config_path: Option<&str>) -> CoreResult<Self> {
        let mut builder = ::config::Config::builder().add_source(
            ::config::Environment::with_prefix("COMMANDBUS")
                .separator("__")
                .try_parsing(true),
        );
        if let Some(path) = config_path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        let settings = builder.build()?;
        let cfg: CommandBusConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Enforce the hard invariant (`statement_timeout_ms` must leave room
    /// inside the visibility window) and log the soft pool-sizing
    /// guideline from spec.md §5 without failing startup over it.
    pub fn validate(&self) -> CoreResult<()> {
        let vt_ms = self.visibility_timeout as u64 * 1000;
        if self.statement_timeout_ms >= vt_ms {
            return Err(CoreError::InvalidOperation(format!(
                "statement_timeout_ms ({}) must be less than visibility_timeout in ms ({})",
                self.statement_timeout_ms, vt_ms
            )));
        }

        // Worker + router concurrency plus a small margin, per spec.md §5.
        let recommended_min = self.concurrency as u32 + self.router_concurrency as u32 + 2;
        if self.pool_max < recommended_min {
            tracing::warn!(
                pool_max = self.pool_max,
                concurrency = self.concurrency,
                router_concurrency = self.router_concurrency,
                recommended_min,
                "pool_max is smaller than concurrency + router_concurrency + overhead; connections may be starved under load"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CommandBusConfig {
        CommandBusConfig {
            database_url: "postgres://localhost/commandbus".into(),
            max_attempts: 5,
            backoff_schedule: BackoffSchedule::default(),
            visibility_timeout: 30,
            statement_timeout_ms: 15_000,
            concurrency: 10,
            poll_interval_ms: 500,
            pool_min: 2,
            pool_max: 20,
            router_concurrency: 4,
        }
    }

    #[test]
    fn backoff_schedule_clamps_to_last_entry() {
        let schedule = BackoffSchedule(vec![5, 15, 60]);
        assert_eq!(schedule.delay_for_attempt(1), 5);
        assert_eq!(schedule.delay_for_attempt(3), 60);
        assert_eq!(schedule.delay_for_attempt(10), 60);
    }

    #[test]
    fn validate_rejects_statement_timeout_at_or_above_visibility_window() {
        let mut cfg = base_config();
        cfg.statement_timeout_ms = 30_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_statement_timeout_inside_visibility_window() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_warns_but_does_not_fail_on_small_pool_max() {
        let mut cfg = base_config();
        cfg.pool_max = 1;
        assert!(cfg.validate().is_ok());
    }
}
