//! Core abstractions for the relay workflow engine
//!
//! This crate provides the data model and the contracts shared by the
//! runtime, node libraries and storage backends. It contains no scheduling
//! logic.

mod error;
pub mod events;
mod node;
mod persistence;
mod run;
mod workflow;

pub use error::{
    DispatchError, EngineError, GraphError, NodeExecutionError, PersistenceError, PortDirection,
};
pub use events::{EventPublisher, EventSubscription, RunEvent};
pub use node::{
    CapturedFailure, CredentialProvider, CredentialsHandle, InputItem, MergePolicy, NodeContext,
    NodeExecutor, NodeInput, NodeMetadata, NodeOutput, PortDefinition, ValidationResult,
};
pub use persistence::PersistenceGateway;
pub use run::{
    FailedNode, FailureKind, FailureReason, NodeExecutionRecord, NodeFailure, NodeStatus, Run,
    RunFailure, RunId, RunStatus, RunSummary, RunUpdate, SkipReason,
};
pub use workflow::{
    BackoffStrategy, Connection, ConnectionKind, ErrorHandling, NodeId, NodeSpec, RetryPolicy,
    WorkflowDefinition, WorkflowId, WorkflowSettings,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
