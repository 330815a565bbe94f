use async_trait::async_trait;
use relaycore::{
    NodeContext, NodeExecutionError, NodeExecutor, NodeMetadata, NodeOutput, PortDefinition,
    ValidationResult,
};
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration, then pass the input through.
///
/// The wait ends early with `Cancelled` when the run is cancelled.
pub struct DelayNode;

#[async_trait]
impl NodeExecutor for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![PortDefinition::main()],
        }
    }

    fn validate(&self, config: &Map<String, Value>) -> ValidationResult {
        match config.get("delay_ms") {
            None => ValidationResult::ok(),
            Some(v) if v.as_u64().is_some() => ValidationResult::ok(),
            Some(_) => ValidationResult::ok().issue("delay_ms must be a non-negative integer"),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let delay_ms = ctx
            .config
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS);

        tracing::debug!("Node {} delaying for {}ms", ctx.node_id, delay_ms);

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeExecutionError::Cancelled),
        }

        Ok(NodeOutput::single(ctx.input.merged()))
    }
}
