//! Concrete-manager contract (`spec.md` §4.8 "Contract of a concrete
//! manager"): each process type supplies pure, JSON-based transition
//! logic; the engine owns persistence, sends, and replies.

use serde_json::Value;

use commandbus_core::ReplyEnvelope;

/// What [`ProcessManager::build_command`] produces for the engine to send
/// through the command bus.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub command_type: String,
    pub data: Value,
}

/// A concrete process manager. State and steps are kept as JSON/string so
/// managers can be registered and dispatched through a trait object
/// (`spec.md` §4.9 "Resolve the manager instance by `process.process_type`");
/// a manager typically deserializes its own typed state internally.
pub trait ProcessManager: Send + Sync {
    fn process_type(&self) -> &str;
    fn domain(&self) -> &str;

    fn create_initial_state(&self, input: Value) -> Value;
    fn get_first_step(&self, state: &Value) -> String;
    fn build_command(&self, step: &str, state: &Value) -> ProcessCommand;

    /// Apply a successful reply to `state` in place.
    fn update_state(&self, state: &mut Value, step: &str, reply: &ReplyEnvelope);

    /// `None` means the process is done (success-complete).
    fn get_next_step(&self, step: &str, reply: &ReplyEnvelope, state: &Value) -> Option<String>;

    /// `None` means the step has nothing to undo.
    fn get_compensation_step(&self, step: &str) -> Option<String> {
        let _ = step;
        None
    }
}

/// Process-wide registry of managers, keyed by `process_type` within one
/// domain (`spec.md` §5 "Process-wide state").
#[derive(Default)]
pub struct ManagerRegistry {
    managers: std::collections::HashMap<String, std::sync::Arc<dyn ProcessManager>>,
}

impl std::fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("registered", &self.managers.len())
            .finish()
    }
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manager: std::sync::Arc<dyn ProcessManager>) {
        self.managers.insert(manager.process_type().to_string(), manager);
    }

    pub fn get(&self, process_type: &str) -> Option<std::sync::Arc<dyn ProcessManager>> {
        self.managers.get(process_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl ProcessManager for Noop {
        fn process_type(&self) -> &str {
            "Noop"
        }
        fn domain(&self) -> &str {
            "reporting"
        }
        fn create_initial_state(&self, input: Value) -> Value {
            input
        }
        fn get_first_step(&self, _state: &Value) -> String {
            "only".into()
        }
        fn build_command(&self, _step: &str, _state: &Value) -> ProcessCommand {
            ProcessCommand {
                command_type: "Noop".into(),
                data: Value::Null,
            }
        }
        fn update_state(&self, _state: &mut Value, _step: &str, _reply: &ReplyEnvelope) {}
        fn get_next_step(&self, _step: &str, _reply: &ReplyEnvelope, _state: &Value) -> Option<String> {
            None
        }
    }

    #[test]
    fn registry_resolves_by_process_type() {
        let mut registry = ManagerRegistry::new();
        registry.register(std::sync::Arc::new(Noop));
        assert!(registry.get("Noop").is_some());
        assert!(registry.get("Other").is_none());
    }

    #[test]
    fn default_compensation_step_is_none() {
        assert_eq!(Noop.get_compensation_step("only"), None);
    }
}
