use crate::{NodeId, RunId, WorkflowId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Coordinator of run {0} stopped without reporting a result")]
    RunAborted(RunId),

    #[error("Run {0} is still active")]
    RunActive(RunId),

    #[error("Invalid configuration for node '{node_id}': {}", issues.join("; "))]
    InvalidNodeConfig { node_id: NodeId, issues: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Problems found while turning a workflow definition into an execution plan.
///
/// These surface before any node executes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cyclic dependency between nodes: {}", nodes.join(", "))]
    Cycle { nodes: Vec<NodeId> },

    #[error("Connection #{connection} references missing node '{node_id}'")]
    DanglingReference { node_id: NodeId, connection: usize },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Unknown node type '{node_type}' for node '{node_id}'")]
    UnknownNodeType { node_id: NodeId, node_type: String },

    #[error("Node '{node_id}' has no {direction} port {port} (declares {available})")]
    InvalidPort {
        node_id: NodeId,
        direction: PortDirection,
        port: usize,
        available: usize,
    },

    #[error("Node '{node_id}' requires {required} inputs but only {available} connections lead to it")]
    InvalidMergePolicy {
        node_id: NodeId,
        required: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl std::fmt::Display for PortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// Error raised by a node's `execute`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeExecutionError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Execution failed: {message}")]
    Failed { message: String, retryable: bool },

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeExecutionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Hint from the node implementation whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Infrastructure failures of the dispatch backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch backend unavailable: {0}")]
    Unavailable(String),

    #[error("No worker capacity after waiting {waited_ms}ms")]
    CapacityExhausted { waited_ms: u64 },

    #[error("Run cancelled while waiting for capacity")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Storage backend error: {0}")]
    Backend(String),
}
