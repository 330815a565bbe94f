use async_trait::async_trait;
use relaycore::{
    NodeContext, NodeExecutionError, NodeExecutor, NodeMetadata, NodeOutput, PortDefinition,
    ValidationResult,
};
use serde_json::{Map, Value};

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Set fields on the input object.
///
/// `values` is merged over the input (later keys win). With `keep_input`
/// false the input is dropped. `from_static` copies the named keys out of
/// the workflow static data; `static_data` entries are written back to it.
pub struct SetNode;

#[async_trait]
impl NodeExecutor for SetNode {
    fn node_type(&self) -> &str {
        "transform.set"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Set fields on the input object".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![PortDefinition::main()],
        }
    }

    fn validate(&self, config: &Map<String, Value>) -> ValidationResult {
        let mut result = ValidationResult::ok();
        for key in ["values", "static_data"] {
            if let Some(v) = config.get(key) {
                if !v.is_object() {
                    result = result.issue(format!("{} must be an object", key));
                }
            }
        }
        if let Some(v) = config.get("from_static") {
            if !v.is_array() {
                result = result.issue("from_static must be an array of keys");
            }
        }
        result
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let keep_input = ctx
            .config
            .get("keep_input")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut fields = match ctx.input.merged() {
            Value::Object(map) if keep_input => map,
            Value::Null => Map::new(),
            other if keep_input => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
            _ => Map::new(),
        };
        if let Some(Value::Array(keys)) = ctx.config.get("from_static") {
            for key in keys.iter().filter_map(Value::as_str) {
                if let Some(value) = ctx.static_data.get(key) {
                    fields.insert(key.to_string(), value.clone());
                }
            }
        }
        if let Some(Value::Object(values)) = ctx.config.get("values") {
            fields.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let mut output = NodeOutput::single(Value::Object(fields));
        if let Some(Value::Object(patch)) = ctx.config.get("static_data") {
            for (key, value) in patch {
                output = output.with_static_data(key.clone(), value.clone());
            }
        }
        Ok(output)
    }
}

/// Parse a JSON string field of the input.
pub struct JsonParseNode;

#[async_trait]
impl NodeExecutor for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![PortDefinition::new("parsed", "Parsed value")],
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let field = ctx
            .config
            .get("field")
            .and_then(Value::as_str)
            .unwrap_or("json")
            .to_string();

        let raw = ctx
            .input
            .field(&field)
            .ok_or_else(|| NodeExecutionError::MissingInput(field.clone()))?;
        let text = raw.as_str().ok_or_else(|| NodeExecutionError::InvalidInputType {
            field: field.clone(),
            expected: "string".to_string(),
            actual: type_name(&raw).to_string(),
        })?;

        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| NodeExecutionError::fatal(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::single(parsed))
    }
}

/// Serialize the input to a JSON string.
pub struct JsonStringifyNode;

#[async_trait]
impl NodeExecutor for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![PortDefinition::new("json", "JSON text")],
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let pretty = ctx
            .config
            .get("pretty")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let value = ctx.input.merged();

        let json = if pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| NodeExecutionError::fatal(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::single(serde_json::json!({ "json": json })))
    }
}
