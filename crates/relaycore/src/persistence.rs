use crate::{NodeExecutionRecord, PersistenceError, Run, RunId, RunUpdate, WorkflowDefinition, WorkflowId};
use async_trait::async_trait;

/// Storage collaborator for workflow definitions and execution history.
///
/// Apart from `load_workflow`, failures are never fatal to a run.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, PersistenceError>;

    async fn create_run(&self, run: &Run) -> Result<(), PersistenceError>;

    async fn update_run(&self, run_id: RunId, update: &RunUpdate) -> Result<(), PersistenceError>;

    async fn upsert_node_record(&self, record: &NodeExecutionRecord) -> Result<(), PersistenceError>;
}
