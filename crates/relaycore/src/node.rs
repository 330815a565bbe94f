use crate::{NodeExecutionError, NodeFailure, NodeId, RunId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Contract every node implementation satisfies.
///
/// Implementations are registered once per process under their `node_type`
/// and shared by all runs, so they must not keep per-run state.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Unique type identifier (e.g., "flow.if", "transform.set")
    fn node_type(&self) -> &str;

    /// Description and declared port shapes.
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }

    /// When a node with several incoming connections becomes ready.
    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::RequireAll
    }

    /// Check configuration before a run starts.
    fn validate(&self, _config: &Map<String, Value>) -> ValidationResult {
        ValidationResult::ok()
    }

    /// Execute the node. Long-running implementations should poll
    /// `ctx.checkpoint()` and return `NodeExecutionError::Cancelled` when asked to stop.
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError>;
}

/// Readiness rule for nodes with several incoming connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "count", rename_all = "snake_case")]
pub enum MergePolicy {
    RequireAll,
    RequireAny,
    RequireN(usize),
}

impl MergePolicy {
    /// Whether `populated` of `total` incoming connections satisfy the policy.
    pub fn is_satisfied(self, populated: usize, total: usize) -> bool {
        match self {
            MergePolicy::RequireAll => populated == total,
            MergePolicy::RequireAny => populated >= 1 || total == 0,
            MergePolicy::RequireN(n) => populated >= n,
        }
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: vec![PortDefinition::main()],
            outputs: vec![PortDefinition::main()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn main() -> Self {
        Self::new("main", "")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub issues: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Everything a node sees while executing.
///
/// The input is an immutable snapshot; the only way to affect the run is
/// through the returned `NodeOutput`.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    /// 1-based attempt counter
    pub attempt: u32,
    pub input: NodeInput,
    pub config: Map<String, Value>,
    /// Read-only view of workflow static data at dispatch time.
    pub static_data: Arc<Map<String, Value>>,
    pub credentials: CredentialsHandle,
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeExecutionError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeExecutionError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cooperative cancellation check.
    pub fn checkpoint(&self) -> Result<(), NodeExecutionError> {
        if self.is_cancelled() {
            Err(NodeExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Data delivered to a node by one populated incoming connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    /// `None` for the trigger payload of entry nodes.
    pub source_node: Option<NodeId>,
    pub source_output: usize,
    pub target_input: usize,
    pub data: Value,
}

/// Failure captured for an error-handler node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedFailure {
    pub node_id: NodeId,
    pub attempt: u32,
    pub error: NodeFailure,
}

/// Immutable input view built by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInput {
    /// Ordered by source node id, then ports.
    pub items: Vec<InputItem>,
    pub failure: Option<CapturedFailure>,
}

impl NodeInput {
    pub fn trigger(payload: Value) -> Self {
        Self {
            items: vec![InputItem {
                source_node: None,
                source_output: 0,
                target_input: 0,
                data: payload,
            }],
            failure: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Data arriving on one input port.
    pub fn port(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.items
            .iter()
            .filter(move |item| item.target_input == index)
            .map(|item| &item.data)
    }

    pub fn first(&self) -> Option<&Value> {
        self.items.first().map(|item| &item.data)
    }

    /// Look up a field of the merged input.
    pub fn field(&self, name: &str) -> Option<Value> {
        match self.merged() {
            Value::Object(mut map) => map.remove(name),
            _ => None,
        }
    }

    /// Merge all items into one value.
    ///
    /// A single item is returned as-is; several objects are shallow-merged in
    /// item order (later keys win); anything else becomes an array.
    pub fn merged(&self) -> Value {
        match self.items.as_slice() {
            [] => Value::Null,
            [single] => single.data.clone(),
            items if items.iter().all(|i| i.data.is_object()) => {
                let mut merged = Map::new();
                for item in items {
                    if let Value::Object(map) = &item.data {
                        merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                Value::Object(merged)
            }
            items => Value::Array(items.iter().map(|i| i.data.clone()).collect()),
        }
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// One entry per output port; `None` means nothing was emitted on that branch.
    pub ports: Vec<Option<Value>>,
    /// Keys to merge into the workflow static data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_data: Option<Map<String, Value>>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `value` on port 0.
    pub fn single(value: impl Into<Value>) -> Self {
        Self::new().with_port(0, value)
    }

    pub fn with_port(mut self, port: usize, value: impl Into<Value>) -> Self {
        if self.ports.len() <= port {
            self.ports.resize(port + 1, None);
        }
        self.ports[port] = Some(value.into());
        self
    }

    pub fn with_static_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.static_data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn port(&self, index: usize) -> Option<&Value> {
        self.ports.get(index).and_then(Option::as_ref)
    }

    /// Port values as a JSON value for events and logs.
    pub fn to_value(&self) -> Value {
        match self.ports.as_slice() {
            [] => Value::Null,
            [only] => only.clone().unwrap_or(Value::Null),
            ports => Value::Array(
                ports
                    .iter()
                    .map(|p| p.clone().unwrap_or(Value::Null))
                    .collect(),
            ),
        }
    }
}

/// Resolves credential ids to secret material. Storage and encryption live elsewhere.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, credential_id: &str) -> Result<Value, NodeExecutionError>;
}

/// Named credential references for one node.
#[derive(Clone, Default)]
pub struct CredentialsHandle {
    refs: HashMap<String, String>,
    provider: Option<Arc<dyn CredentialProvider>>,
}

impl CredentialsHandle {
    pub fn new(
        refs: HashMap<String, String>,
        provider: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        Self { refs, provider }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.refs.keys().map(String::as_str)
    }

    /// Resolve a credential declared under `name` on the node.
    pub async fn get(&self, name: &str) -> Result<Value, NodeExecutionError> {
        let id = self
            .refs
            .get(name)
            .ok_or_else(|| NodeExecutionError::Credentials(format!("no credential named '{}'", name)))?;
        let provider = self.provider.as_ref().ok_or_else(|| {
            NodeExecutionError::Credentials("no credential provider configured".to_string())
        })?;
        provider.resolve(id).await
    }
}

impl fmt::Debug for CredentialsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsHandle")
            .field("names", &self.refs.keys().collect::<Vec<_>>())
            .field("provider", &self.provider.is_some())
            .finish()
    }
}
