//! Handler contract and the `Outcome` result type (`spec.md` §9
//! "Exceptions-as-control-flow for retry routing": handler idioms may
//! still raise, but the worker boundary converts everything to this
//! value before it reaches the retry policy).

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use commandbus_core::{Command, ErrorKind};

/// What a handler invocation produced, already classified for routing.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Option<Value>),
    Transient { code: String, message: String },
    Permanent { code: String, message: String },
}

impl Outcome {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Transient { .. } => Some(ErrorKind::Transient),
            Outcome::Permanent { .. } => Some(ErrorKind::Permanent),
        }
    }
}

/// Context passed to a handler for one invocation (`spec.md` §4.6
/// "Per-message processing" step 2).
pub struct HandlerContext<'a> {
    pub command: &'a Command,
    pub attempt: i32,
    pub max_attempts: i32,
    pub msg_id: i64,
    /// The ambient transaction; handler writes using this connection
    /// commit atomically with the completion bookkeeping and roll back
    /// on any failure (`spec.md` §4.6 "Handler transaction participation").
    pub tx: &'a mut Transaction<'static, Postgres>,
}

/// A registered command handler for one `(domain, command_type)` pair.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, data: Value, ctx: &mut HandlerContext<'_>) -> Outcome;
}

/// Process-wide handler map, populated once at composition-root startup
/// (`spec.md` §5 "Process-wide state").
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: std::collections::HashMap<(String, String), std::sync::Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.handlers.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        domain: impl Into<String>,
        command_type: impl Into<String>,
        handler: std::sync::Arc<dyn CommandHandler>,
    ) {
        self.handlers.insert((domain.into(), command_type.into()), handler);
    }

    pub fn get(&self, domain: &str, command_type: &str) -> Option<std::sync::Arc<dyn CommandHandler>> {
        self.handlers
            .get(&(domain.to_string(), command_type.to_string()))
            .cloned()
    }
}

/// Stable identifier for process tracking; not part of the wire format.
pub type CorrelationId = Uuid;

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl CommandHandler for Noop {
        async fn handle(&self, _data: Value, _ctx: &mut HandlerContext<'_>) -> Outcome {
            Outcome::Success(None)
        }
    }

    #[test]
    fn registry_resolves_by_exact_domain_and_type() {
        let mut registry = HandlerRegistry::new();
        registry.register("payments", "Debit", std::sync::Arc::new(Noop));
        assert!(registry.get("payments", "Debit").is_some());
        assert!(registry.get("payments", "Credit").is_none());
        assert!(registry.get("reporting", "Debit").is_none());
    }

    #[test]
    fn outcome_error_kind_classifies_correctly() {
        assert_eq!(Outcome::Success(None).error_kind(), None);
        assert_eq!(
            Outcome::transient("TIMEOUT", "x").error_kind(),
            Some(ErrorKind::Transient)
        );
        assert_eq!(
            Outcome::permanent("INVALID", "x").error_kind(),
            Some(ErrorKind::Permanent)
        );
    }
}
