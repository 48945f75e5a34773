//! Stand-in command handlers for the `reporting` domain's three step
//! types. Business logic is out of scope; each handler only produces the
//! result path its step in `StatementReportProcess` expects.

use async_trait::async_trait;
use commandbus_worker::{CommandHandler, HandlerContext, Outcome};
use serde_json::Value;

#[derive(Debug)]
pub struct StatementQueryHandler;

#[async_trait]
impl CommandHandler for StatementQueryHandler {
    async fn handle(&self, data: Value, ctx: &mut HandlerContext<'_>) -> Outcome {
        let path = format!("/tmp/commandbus-demo/query-{}.json", ctx.command.command_id);
        tracing::info!(command_id = %ctx.command.command_id, ?data, path = %path, "ran statement query");
        Outcome::Success(Some(serde_json::json!({ "query_result_path": path })))
    }
}

#[derive(Debug)]
pub struct StatementDataAggregationHandler;

#[async_trait]
impl CommandHandler for StatementDataAggregationHandler {
    async fn handle(&self, data: Value, ctx: &mut HandlerContext<'_>) -> Outcome {
        let path = format!("/tmp/commandbus-demo/aggregate-{}.json", ctx.command.command_id);
        tracing::info!(command_id = %ctx.command.command_id, ?data, path = %path, "ran statement aggregation");
        Outcome::Success(Some(serde_json::json!({ "aggregation_path": path })))
    }
}

pub struct StatementRenderHandler;

#[async_trait]
impl CommandHandler for StatementRenderHandler {
    async fn handle(&self, data: Value, ctx: &mut HandlerContext<'_>) -> Outcome {
        let output_type = data.get("output_type").and_then(Value::as_str).unwrap_or("pdf");
        let path = format!("/tmp/commandbus-demo/render-{}.{}", ctx.command.command_id, output_type);
        tracing::info!(command_id = %ctx.command.command_id, path = %path, "rendered statement");
        Outcome::Success(Some(serde_json::json!({ "rendered_path": path })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_handler_defaults_output_type_to_pdf() {
        let data = serde_json::json!({});
        let output_type = data.get("output_type").and_then(Value::as_str).unwrap_or("pdf");
        assert_eq!(output_type, "pdf");
    }
}
