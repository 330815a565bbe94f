//! Control-flow nodes: branching, joining and explicit failure.

use async_trait::async_trait;
use relaycore::{
    MergePolicy, NodeContext, NodeExecutionError, NodeExecutor, NodeMetadata, NodeOutput,
    PortDefinition, ValidationResult,
};
use serde_json::{Map, Value};

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Route the input to the `true` (0) or `false` (1) output.
///
/// The condition is the input field named by `field`, compared with `equals`
/// when given, otherwise tested for truthiness. Only the taken port carries
/// data, so nodes behind the other port are skipped.
pub struct IfNode;

#[async_trait]
impl NodeExecutor for IfNode {
    fn node_type(&self) -> &str {
        "flow.if"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Route input by a condition".to_string(),
            category: "flow".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![
                PortDefinition::new("true", "Condition held"),
                PortDefinition::new("false", "Condition did not hold"),
            ],
        }
    }

    fn validate(&self, config: &Map<String, Value>) -> ValidationResult {
        match config.get("field") {
            Some(Value::String(_)) => ValidationResult::ok(),
            Some(_) => ValidationResult::ok().issue("field must be a string"),
            None => ValidationResult::ok().issue("field is required"),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let field = ctx
            .require_config("field")?
            .as_str()
            .ok_or_else(|| NodeExecutionError::Configuration("field must be a string".to_string()))?;
        let actual = ctx.input.field(field).unwrap_or(Value::Null);

        let holds = match ctx.config.get("equals") {
            Some(expected) => &actual == expected,
            None => is_truthy(&actual),
        };
        tracing::debug!("Node {} condition on '{}' is {}", ctx.node_id, field, holds);

        let port = if holds { 0 } else { 1 };
        Ok(NodeOutput::new().with_port(port, ctx.input.merged()))
    }
}

/// Join branches: runs as soon as any incoming branch delivered data.
pub struct MergeNode;

#[async_trait]
impl NodeExecutor for MergeNode {
    fn node_type(&self) -> &str {
        "flow.merge"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Join branches into one output".to_string(),
            category: "flow".to_string(),
            inputs: vec![PortDefinition::new("a", "First branch"), PortDefinition::new("b", "Second branch")],
            outputs: vec![PortDefinition::main()],
        }
    }

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::RequireAny
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        Ok(NodeOutput::single(ctx.input.merged()))
    }
}

/// Fail with `message`. Useful for exercising error handlers.
pub struct FailNode;

#[async_trait]
impl NodeExecutor for FailNode {
    fn node_type(&self) -> &str {
        "flow.fail"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Fail the node with a message".to_string(),
            category: "flow".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![PortDefinition::main()],
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let message = ctx
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("failed on purpose")
            .to_string();
        let retryable = ctx
            .config
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Err(NodeExecutionError::Failed { message, retryable })
    }
}
