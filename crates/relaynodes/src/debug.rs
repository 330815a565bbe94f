use async_trait::async_trait;
use relaycore::{NodeContext, NodeExecutionError, NodeExecutor, NodeMetadata, NodeOutput, PortDefinition};
use serde_json::Value;

/// Simple debug node that logs its input and passes it through
pub struct DebugNode;

#[async_trait]
impl NodeExecutor for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![PortDefinition::main()],
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let input = ctx.input.merged();
        let message = ctx
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)");

        tracing::info!(
            "DEBUG [{} / run {}]: {} {}",
            ctx.node_id,
            ctx.run_id,
            message,
            input
        );

        Ok(NodeOutput::single(input))
    }
}
