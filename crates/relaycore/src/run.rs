use crate::{NodeExecutionError, NodeId, NodeOutput, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Terminal states are absorbing.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// One invocation of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub trigger_input: Value,
    pub failure: Option<RunFailure>,
}

impl Run {
    pub fn new(workflow_id: WorkflowId, trigger_input: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            trigger_input,
            failure: None,
        }
    }

    /// Apply a status transition, stamping start/finish times.
    ///
    /// Returns `false` and leaves the run untouched when the transition is not allowed.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        true
    }

    /// The fields changed by the latest transition, for the persistence gateway.
    pub fn status_update(&self) -> RunUpdate {
        RunUpdate {
            status: Some(self.status),
            started_at: self.started_at,
            finished_at: self.finished_at,
            failure: self.failure.clone(),
        }
    }
}

/// Partial update of a persisted run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
}

impl RunUpdate {
    pub fn apply_to(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if self.started_at.is_some() {
            run.started_at = self.started_at;
        }
        if self.finished_at.is_some() {
            run.finished_at = self.finished_at;
        }
        if self.failure.is_some() {
            run.failure = self.failure.clone();
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.map(RunStatus::is_terminal).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: FailureReason,
    pub nodes: Vec<FailedNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A node implementation failed and nothing handled it.
    NodeFailures,
    /// The dispatch backend could not run a node within the infra-retry ceiling.
    InfrastructureFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedNode {
    pub node_id: NodeId,
    pub error: NodeFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Why a node never ran (or was abandoned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    UpstreamFailed { node_id: NodeId },
    BranchNotTaken,
    Cancelled,
    RunHalted,
}

/// Serializable summary of a node failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    Timeout,
    Cancelled,
    Infrastructure,
}

impl NodeFailure {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Infrastructure,
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<&NodeExecutionError> for NodeFailure {
    fn from(err: &NodeExecutionError) -> Self {
        let kind = match err {
            NodeExecutionError::Timeout { .. } => FailureKind::Timeout,
            NodeExecutionError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Execution,
        };
        Self {
            kind,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Per-node, per-run execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_type: String,
    pub status: NodeStatus,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_snapshot: Option<Value>,
    pub output: Option<NodeOutput>,
    pub error: Option<NodeFailure>,
    pub skip_reason: Option<SkipReason>,
}

impl NodeExecutionRecord {
    pub fn new(run_id: RunId, node_id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
            input_snapshot: None,
            output: None,
            error: None,
            skip_reason: None,
        }
    }
}

/// Final state of a run as reported by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: Run,
    /// Sorted by node id.
    pub records: Vec<NodeExecutionRecord>,
}

impl RunSummary {
    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn record(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.record(node_id).map(|r| r.status)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.node_id.clone())
            .collect()
    }

    pub fn completed_nodes(&self) -> Vec<NodeId> {
        self.nodes_with_status(NodeStatus::Succeeded)
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.nodes_with_status(NodeStatus::Failed)
    }

    pub fn skipped_nodes(&self) -> Vec<NodeId> {
        self.nodes_with_status(NodeStatus::Skipped)
    }

    /// Data the node emitted on the given output port.
    pub fn output(&self, node_id: &str, port: usize) -> Option<&Value> {
        self.record(node_id)?.output.as_ref()?.port(port)
    }
}
