use async_trait::async_trait;
use relaycore::{
    NodeExecutionRecord, PersistenceError, PersistenceGateway, Run, RunId, RunUpdate,
    WorkflowDefinition, WorkflowId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-process storage for workflows, runs and node records.
#[derive(Default)]
pub struct InMemoryStore {
    workflows: Arc<RwLock<HashMap<WorkflowId, WorkflowDefinition>>>,
    runs: Arc<RwLock<HashMap<RunId, Run>>>,
    records: Arc<RwLock<HashMap<RunId, BTreeMap<String, NodeExecutionRecord>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow
    pub async fn insert_workflow(&self, workflow: WorkflowDefinition) -> WorkflowId {
        let id = workflow.id;
        self.workflows.write().await.insert(id, workflow);
        id
    }

    pub async fn workflow_ids(&self) -> Vec<WorkflowId> {
        self.workflows.read().await.keys().copied().collect()
    }

    pub async fn run(&self, run_id: RunId) -> Option<Run> {
        self.runs.read().await.get(&run_id).cloned()
    }

    pub async fn runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Records of a run, sorted by node id.
    pub async fn node_records(&self, run_id: RunId) -> Vec<NodeExecutionRecord> {
        self.records
            .read()
            .await
            .get(&run_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryStore {
    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, PersistenceError> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or(PersistenceError::WorkflowNotFound(workflow_id))
    }

    async fn create_run(&self, run: &Run) -> Result<(), PersistenceError> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run_id: RunId, update: &RunUpdate) -> Result<(), PersistenceError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or(PersistenceError::RunNotFound(run_id))?;
        update.apply_to(run);
        Ok(())
    }

    async fn upsert_node_record(&self, record: &NodeExecutionRecord) -> Result<(), PersistenceError> {
        self.records
            .write()
            .await
            .entry(record.run_id)
            .or_default()
            .insert(record.node_id.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycore::{NodeStatus, RunStatus};
    use serde_json::Value;
    use uuid::Uuid;

    #[tokio::test]
    async fn missing_workflow_is_reported() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(
            store.load_workflow(id).await.unwrap_err(),
            PersistenceError::WorkflowNotFound(id)
        );
    }

    #[tokio::test]
    async fn run_updates_apply_to_stored_run() {
        let store = InMemoryStore::new();
        let mut run = Run::new(Uuid::new_v4(), Value::Null);
        store.create_run(&run).await.unwrap();

        run.transition(RunStatus::Running);
        store.update_run(run.run_id, &run.status_update()).await.unwrap();
        assert_eq!(store.run(run.run_id).await.unwrap().status, RunStatus::Running);

        let unknown = Uuid::new_v4();
        assert_eq!(
            store.update_run(unknown, &RunUpdate::default()).await.unwrap_err(),
            PersistenceError::RunNotFound(unknown)
        );
    }

    #[tokio::test]
    async fn node_records_are_upserted_by_node_id() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        let mut record = NodeExecutionRecord::new(run_id, "b", "noop");
        store.upsert_node_record(&record).await.unwrap();
        record.status = NodeStatus::Succeeded;
        store.upsert_node_record(&record).await.unwrap();
        store
            .upsert_node_record(&NodeExecutionRecord::new(run_id, "a", "noop"))
            .await
            .unwrap();

        let records = store.node_records(run_id).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].node_id, "a");
        assert_eq!(records[1].status, NodeStatus::Succeeded);
    }
}
