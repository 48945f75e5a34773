//! `StatementReportProcess`: the three-step reporting scenario from
//! `spec.md` §8 scenario 6, wired up as a concrete [`ProcessManager`].

use commandbus_core::ReplyEnvelope;
use commandbus_process::{ProcessCommand, ProcessManager};
use serde_json::Value;

const STEP_QUERY: &str = "StatementQuery";
const STEP_AGGREGATE: &str = "StatementDataAggregation";
const STEP_RENDER: &str = "StatementRender";

/// `start({from_date, to_date, accounts, output_type})` drives
/// `StatementQuery -> StatementDataAggregation -> StatementRender`,
/// collecting a `*_path` result field from each step's reply.
#[derive(Debug)]
pub struct StatementReportProcess;

impl ProcessManager for StatementReportProcess {
    fn process_type(&self) -> &str {
        "StatementReportProcess"
    }

    fn domain(&self) -> &str {
        "reporting"
    }

    fn create_initial_state(&self, input: Value) -> Value {
        input
    }

    fn get_first_step(&self, _state: &Value) -> String {
        STEP_QUERY.to_string()
    }

    fn build_command(&self, step: &str, state: &Value) -> ProcessCommand {
        let data = match step {
            STEP_QUERY => serde_json::json!({
                "from_date": state["from_date"],
                "to_date": state["to_date"],
                "accounts": state["accounts"],
            }),
            STEP_AGGREGATE => serde_json::json!({
                "query_result_path": state["query_result_path"],
            }),
            STEP_RENDER => serde_json::json!({
                "aggregation_path": state["aggregation_path"],
                "output_type": state["output_type"],
            }),
            other => serde_json::json!({ "step": other }),
        };
        ProcessCommand {
            command_type: step.to_string(),
            data,
        }
    }

    fn update_state(&self, state: &mut Value, step: &str, reply: &ReplyEnvelope) {
        let Some(data) = &reply.data else { return };
        let field = match step {
            STEP_QUERY => "query_result_path",
            STEP_AGGREGATE => "aggregation_path",
            STEP_RENDER => "rendered_path",
            _ => return,
        };
        if let Some(path) = data.get(field) {
            state[field] = path.clone();
        }
    }

    fn get_next_step(&self, step: &str, _reply: &ReplyEnvelope, _state: &Value) -> Option<String> {
        match step {
            STEP_QUERY => Some(STEP_AGGREGATE.to_string()),
            STEP_AGGREGATE => Some(STEP_RENDER.to_string()),
            STEP_RENDER => None,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_sequence_runs_query_then_aggregate_then_render() {
        let manager = StatementReportProcess;
        let state = serde_json::json!({});
        let first = manager.get_first_step(&state);
        assert_eq!(first, STEP_QUERY);

        let reply = ReplyEnvelope::success(uuid::Uuid::nil(), None, None);
        assert_eq!(
            manager.get_next_step(&first, &reply, &state),
            Some(STEP_AGGREGATE.to_string())
        );
        assert_eq!(
            manager.get_next_step(STEP_AGGREGATE, &reply, &state),
            Some(STEP_RENDER.to_string())
        );
        assert_eq!(manager.get_next_step(STEP_RENDER, &reply, &state), None);
    }

    #[test]
    fn update_state_captures_result_path_per_step() {
        let manager = StatementReportProcess;
        let mut state = serde_json::json!({});
        let reply = ReplyEnvelope::success(
            uuid::Uuid::nil(),
            None,
            Some(serde_json::json!({"query_result_path": "/tmp/query.json"})),
        );
        manager.update_state(&mut state, STEP_QUERY, &reply);
        assert_eq!(state["query_result_path"], "/tmp/query.json");
    }
}
