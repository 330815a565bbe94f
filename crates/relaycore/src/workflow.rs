use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;

/// Declared node id. Ids order the nodes inside an execution layer.
pub type NodeId = String;

/// Immutable workflow graph handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Workflow-level data shared by all nodes of a run.
    #[serde(default)]
    pub static_data: Map<String, Value>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
            static_data: Map::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Connect output port 0 of `from` to input port 0 of `to`.
    pub fn connect(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) {
        self.connect_ports(from, 0, to, 0);
    }

    pub fn connect_ports(
        &mut self,
        from: impl Into<NodeId>,
        from_port: usize,
        to: impl Into<NodeId>,
        to_port: usize,
    ) {
        self.connections.push(Connection {
            source_node: from.into(),
            source_output: from_port,
            target_node: to.into(),
            target_input: to_port,
            kind: ConnectionKind::Main,
        });
    }

    /// Route the failure of `from` into input port 0 of `handler`.
    pub fn connect_error(&mut self, from: impl Into<NodeId>, handler: impl Into<NodeId>) {
        self.connections.push(Connection {
            source_node: from.into(),
            source_output: 0,
            target_node: handler.into(),
            target_input: 0,
            kind: ConnectionKind::Error,
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node descriptor inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Credential name -> credential id in the external credential store.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Disabled nodes are not executed; their input is forwarded unchanged.
    #[serde(default)]
    pub disabled: bool,
    /// Overrides `WorkflowSettings::on_error` for failures of this node.
    #[serde(default)]
    pub on_error: Option<ErrorHandling>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: Map::new(),
            credentials: HashMap::new(),
            retry_policy: None,
            timeout_ms: None,
            disabled: false,
            on_error: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_credential(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.credentials.insert(name.into(), id.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn with_on_error(mut self, handling: ErrorHandling) -> Self {
        self.on_error = Some(handling);
        self
    }
}

/// Edge from an output port of one node to an input port of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source_node: NodeId,
    #[serde(default)]
    pub source_output: usize,
    pub target_node: NodeId,
    #[serde(default)]
    pub target_input: usize,
    #[serde(default)]
    pub kind: ConnectionKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Carries the source's output data.
    #[default]
    Main,
    /// Carries the source's failure. Populated only when the source fails.
    Error,
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::None,
        }
    }

    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed { delay_ms },
        }
    }

    /// Delay doubles after each failed attempt, starting at `initial_ms`.
    pub fn exponential(max_attempts: u32, initial_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential {
                initial_ms,
                multiplier: 2.0,
                max_ms: None,
            },
        }
    }

    /// Delay before the attempt that follows `failed_attempt` (1-based).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        self.backoff.delay_after(failed_attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        #[serde(default)]
        max_ms: Option<u64>,
    },
}

impl BackoffStrategy {
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = failed_attempt.saturating_sub(1).min(32) as i32;
                let millis = (*initial_ms as f64) * multiplier.max(1.0).powi(exponent);
                let capped = match max_ms {
                    Some(max) => millis.min(*max as f64),
                    None => millis,
                };
                Duration::from_millis(capped.min(u64::MAX as f64) as u64)
            }
        }
    }
}

/// Per-workflow overrides of engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
    #[serde(default)]
    pub default_retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_error: ErrorHandling,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Unhandled failures skip their dependents; independent branches keep running.
    #[default]
    ContinueBranches,
    /// The first unhandled failure stops all further dispatch.
    StopRun,
}
