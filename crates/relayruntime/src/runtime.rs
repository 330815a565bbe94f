use crate::coordinator::{CoordinatorParts, RunCoordinator};
use crate::dispatch::{BackpressureMode, DispatchBackend, WorkerPool, WorkerPoolConfig};
use crate::persistence::{PersistenceRetry, PersistenceWriter};
use crate::plan::{resolve, ExecutionPlan};
use crate::registry::NodeRegistry;
use relaycore::{
    CredentialProvider, EngineError, EventPublisher, EventSubscription, PersistenceGateway,
    RetryPolicy, Run, RunId, RunSummary, WorkflowDefinition, WorkflowId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Node executions allowed at once across all runs.
    pub max_in_flight: usize,
    pub backpressure: BackpressureMode,
    pub submit_timeout_ms: u64,
    pub event_buffer_size: usize,
    pub node_timeout_ms: u64,
    /// How long a cancelled run waits for in-flight nodes.
    pub cancel_drain_timeout_ms: u64,
    pub max_infra_retries: u32,
    pub infra_retry_delay_ms: u64,
    pub default_retry: RetryPolicy,
    pub persistence_retry_attempts: u32,
    pub persistence_retry_delay_ms: u64,
    /// How long a finished run stays queryable. `None` keeps it until `forget_run`.
    pub finished_run_retention_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            backpressure: BackpressureMode::Block,
            submit_timeout_ms: 30_000,
            event_buffer_size: 1000,
            node_timeout_ms: 300_000,
            cancel_drain_timeout_ms: 10_000,
            max_infra_retries: 3,
            infra_retry_delay_ms: 500,
            default_retry: RetryPolicy::none(),
            persistence_retry_attempts: 5,
            persistence_retry_delay_ms: 200,
            finished_run_retention_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_in_flight: self.max_in_flight,
            backpressure: self.backpressure,
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
        }
    }

    fn persistence_retry(&self) -> PersistenceRetry {
        PersistenceRetry {
            max_attempts: self.persistence_retry_attempts,
            initial_delay: Duration::from_millis(self.persistence_retry_delay_ms),
        }
    }
}

struct RunEntry {
    status: watch::Receiver<Run>,
    summary: watch::Receiver<Option<Arc<RunSummary>>>,
    cancellation: CancellationToken,
}

/// Main runtime for executing workflows
///
/// Owns the shared worker pool, the event publisher and the persistence
/// writer. Each started run gets its own coordinator task.
pub struct RelayRuntime {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn PersistenceGateway>,
    backend: Arc<dyn DispatchBackend>,
    events: EventPublisher,
    persistence: PersistenceWriter,
    credentials: Option<Arc<dyn CredentialProvider>>,
    config: Arc<RuntimeConfig>,
    runs: Arc<RwLock<HashMap<RunId, RunEntry>>>,
}

impl RelayRuntime {
    /// Create a runtime backed by a worker pool. Must be called inside a tokio runtime.
    pub fn new(
        registry: NodeRegistry,
        store: Arc<dyn PersistenceGateway>,
        config: RuntimeConfig,
    ) -> Self {
        let backend: Arc<dyn DispatchBackend> = Arc::new(WorkerPool::new(config.worker_pool()));
        let persistence = PersistenceWriter::spawn(Arc::clone(&store), config.persistence_retry());

        Self {
            registry: Arc::new(registry),
            store,
            backend,
            events: EventPublisher::new(config.event_buffer_size),
            persistence,
            credentials: None,
            config: Arc::new(config),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the dispatch backend
    pub fn with_backend(mut self, backend: Arc<dyn DispatchBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Resolve node credential references through `provider`.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn DispatchBackend> {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Validate a workflow and compute its execution plan without running it.
    pub fn plan(&self, workflow: &WorkflowDefinition) -> Result<ExecutionPlan, EngineError> {
        let plan = resolve(workflow, &self.registry)?;

        for spec in &workflow.nodes {
            let Some(executor) = self.registry.get(&spec.node_type) else {
                continue;
            };
            let result = executor.validate(&spec.config);
            if !result.is_valid() {
                return Err(EngineError::InvalidNodeConfig {
                    node_id: spec.id.clone(),
                    issues: result.issues,
                });
            }
        }

        Ok(plan)
    }

    /// Load a stored workflow and start a run of it.
    ///
    /// Returns once the run is created; nothing is created when loading or
    /// validation fails.
    pub async fn start_run(
        &self,
        workflow_id: WorkflowId,
        trigger_input: Value,
    ) -> Result<RunId, EngineError> {
        let workflow = self.store.load_workflow(workflow_id).await.map_err(|e| {
            tracing::error!("Failed to load workflow {}: {}", workflow_id, e);
            e
        })?;
        self.launch(workflow, trigger_input).await
    }

    /// Run a workflow definition that is not stored and wait for the result.
    pub async fn execute(
        &self,
        workflow: WorkflowDefinition,
        trigger_input: Value,
    ) -> Result<RunSummary, EngineError> {
        let run_id = self.launch(workflow, trigger_input).await?;
        self.wait_for_run(run_id).await
    }

    async fn launch(
        &self,
        workflow: WorkflowDefinition,
        trigger_input: Value,
    ) -> Result<RunId, EngineError> {
        let plan = self.plan(&workflow).map_err(|e| {
            tracing::error!("Workflow {} rejected: {}", workflow.id, e);
            e
        })?;

        let run = Run::new(workflow.id, trigger_input);
        let run_id = run.run_id;
        self.persistence.create_run(&run);

        let (status_tx, status_rx) = watch::channel(run.clone());
        let (summary_tx, summary_rx) = watch::channel(None);
        let cancellation = CancellationToken::new();

        self.events.open(run_id);
        self.runs.write().await.insert(
            run_id,
            RunEntry {
                status: status_rx,
                summary: summary_rx,
                cancellation: cancellation.clone(),
            },
        );

        let coordinator = RunCoordinator::new(CoordinatorParts {
            run,
            workflow: Arc::new(workflow),
            plan: Arc::new(plan),
            registry: Arc::clone(&self.registry),
            backend: Arc::clone(&self.backend),
            events: self.events.clone(),
            persistence: self.persistence.clone(),
            credentials: self.credentials.clone(),
            config: Arc::clone(&self.config),
            cancellation,
            status: status_tx,
        });

        let retention = self.config.finished_run_retention_ms.map(Duration::from_millis);
        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            let summary = coordinator.run().await;
            let _ = summary_tx.send(Some(Arc::new(summary)));

            if let Some(retention) = retention {
                tokio::time::sleep(retention).await;
                if runs.write().await.remove(&run_id).is_some() {
                    tracing::debug!("Evicted finished run {} after {:?}", run_id, retention);
                }
            }
        });

        tracing::info!("Created run {}", run_id);
        Ok(run_id)
    }

    /// Request cancellation. Repeated calls and calls on finished runs are no-ops.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), EngineError> {
        let runs = self.runs.read().await;
        let entry = runs.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;

        if entry.status.borrow().status.is_terminal() {
            tracing::debug!("Run {} already finished; ignoring cancel", run_id);
            return Ok(());
        }
        if !entry.cancellation.is_cancelled() {
            tracing::info!("Cancellation requested for run {}", run_id);
            entry.cancellation.cancel();
        }
        Ok(())
    }

    /// Drop a finished run from the runtime's bookkeeping.
    ///
    /// Its persisted state is untouched. Active runs cannot be forgotten.
    pub async fn forget_run(&self, run_id: RunId) -> Result<(), EngineError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        if entry.summary.borrow().is_none() {
            return Err(EngineError::RunActive(run_id));
        }
        runs.remove(&run_id);
        tracing::debug!("Forgot run {}", run_id);
        Ok(())
    }

    /// Runs the runtime still tracks, active or finished.
    pub async fn tracked_runs(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Current state of a run.
    pub async fn get_run_status(&self, run_id: RunId) -> Result<Run, EngineError> {
        let runs = self.runs.read().await;
        let entry = runs.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        let run = entry.status.borrow().clone();
        Ok(run)
    }

    /// Wait until a run reaches a terminal state.
    pub async fn wait_for_run(&self, run_id: RunId) -> Result<RunSummary, EngineError> {
        let mut summary = {
            let runs = self.runs.read().await;
            runs.get(&run_id)
                .ok_or(EngineError::RunNotFound(run_id))?
                .summary
                .clone()
        };

        let done = summary
            .wait_for(|s| s.is_some())
            .await
            .map_err(|_| EngineError::RunAborted(run_id))?;
        match done.as_ref() {
            Some(summary) => Ok(RunSummary::clone(summary)),
            None => Err(EngineError::RunAborted(run_id)),
        }
    }

    /// Events of one run. Events published before this call are not replayed,
    /// and the subscription ends after the run's terminal event.
    pub fn subscribe(&self, run_id: RunId) -> EventSubscription {
        self.events.subscribe(run_id)
    }

    /// Events of every run; subscribe before starting a run to see all of them.
    pub fn subscribe_all(&self) -> EventSubscription {
        self.events.subscribe_all()
    }
}
