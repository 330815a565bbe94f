// Shared test doubles for the runtime integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use relaycore::{
    CredentialProvider, DispatchError, EventSubscription, NodeContext, NodeExecutionError,
    NodeExecutionRecord, NodeExecutor, NodeOutput, PersistenceError, PersistenceGateway, Run,
    RunEvent, RunId, RunUpdate, WorkflowDefinition, WorkflowId,
};
use relayruntime::{
    DispatchBackend, InMemoryStore, Job, JobHandle, NodeRegistry, RelayRuntime, RuntimeConfig,
    WorkerPool,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("relayruntime=debug")
        .try_init();
}

/// Outputs `config.value`, or `{}` when unset.
pub struct Emit;

#[async_trait]
impl NodeExecutor for Emit {
    fn node_type(&self) -> &str {
        "emit"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        Ok(NodeOutput::single(ctx.get_config_or("value", json!({}))))
    }
}

/// Outputs its merged input.
pub struct Echo;

#[async_trait]
impl NodeExecutor for Echo {
    fn node_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        Ok(NodeOutput::single(ctx.input.merged()))
    }
}

/// Always fails; `config.retryable` selects the error class.
pub struct Fail;

#[async_trait]
impl NodeExecutor for Fail {
    fn node_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        if ctx.get_config_or("retryable", json!(false)) == json!(true) {
            Err(NodeExecutionError::retryable("boom"))
        } else {
            Err(NodeExecutionError::fatal("boom"))
        }
    }
}

/// Fails retryably until attempt `config.failures + 1`.
pub struct Flaky;

#[async_trait]
impl NodeExecutor for Flaky {
    fn node_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let failures = ctx.get_config_or("failures", json!(0)).as_u64().unwrap_or(0) as u32;
        if ctx.attempt <= failures {
            return Err(NodeExecutionError::retryable(format!(
                "attempt {} failed",
                ctx.attempt
            )));
        }
        Ok(NodeOutput::single(json!({ "attempt": ctx.attempt })))
    }
}

/// Sleeps `config.millis`, returning early with `Cancelled` when the run is cancelled.
pub struct Wait;

#[async_trait]
impl NodeExecutor for Wait {
    fn node_type(&self) -> &str {
        "wait"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let millis = ctx.get_config_or("millis", json!(10)).as_u64().unwrap_or(10);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                Ok(NodeOutput::single(json!({ "waited": millis })))
            }
            _ = ctx.cancellation.cancelled() => Err(NodeExecutionError::Cancelled),
        }
    }
}

/// Sleeps `config.millis` without looking at the cancellation token.
pub struct Stubborn;

#[async_trait]
impl NodeExecutor for Stubborn {
    fn node_type(&self) -> &str {
        "stubborn"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let millis = ctx.get_config_or("millis", json!(10)).as_u64().unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(NodeOutput::single(json!({ "waited": millis })))
    }
}

/// Succeeds without emitting data on any port.
pub struct Silent;

#[async_trait]
impl NodeExecutor for Silent {
    fn node_type(&self) -> &str {
        "silent"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        Ok(NodeOutput::new())
    }
}

/// Error handler: reports which node failed.
pub struct Handler;

#[async_trait]
impl NodeExecutor for Handler {
    fn node_type(&self) -> &str {
        "handler"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let failure = ctx.input.failure.as_ref().ok_or(NodeExecutionError::MissingInput(
            "failure".to_string(),
        ))?;
        Ok(NodeOutput::single(json!({
            "handled": failure.node_id,
            "message": failure.error.message,
        })))
    }
}

/// Outputs the credential declared as `api`.
pub struct Secret;

#[async_trait]
impl NodeExecutor for Secret {
    fn node_type(&self) -> &str {
        "secret"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let token = ctx.credentials.get("api").await?;
        Ok(NodeOutput::single(json!({ "token": token })))
    }
}

/// Resolves credential ids from a fixed table.
pub struct StaticCredentials(pub Vec<(&'static str, &'static str)>);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn resolve(&self, credential_id: &str) -> Result<serde_json::Value, NodeExecutionError> {
        self.0
            .iter()
            .find(|(id, _)| *id == credential_id)
            .map(|(_, secret)| json!(secret))
            .ok_or_else(|| NodeExecutionError::Credentials(format!("unknown credential {}", credential_id)))
    }
}

/// Tracks how many executions overlap.
#[derive(Default, Clone)]
pub struct Probe {
    pub current: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeExecutor for Probe {
    fn node_type(&self) -> &str {
        "probe"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutput::single(json!({})))
    }
}

pub fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(Emit));
    registry.register(Arc::new(Echo));
    registry.register(Arc::new(Fail));
    registry.register(Arc::new(Flaky));
    registry.register(Arc::new(Wait));
    registry.register(Arc::new(Stubborn));
    registry.register(Arc::new(Silent));
    registry.register(Arc::new(Handler));
    registry.register(Arc::new(Secret));
    registry
}

pub fn runtime(config: RuntimeConfig) -> (RelayRuntime, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let runtime = RelayRuntime::new(registry(), store.clone(), config);
    (runtime, store)
}

/// Collect events of `run_id` up to and including its terminal event.
pub async fn collect_events(events: &mut EventSubscription, run_id: RunId) -> Vec<RunEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        if event.run_id() != Some(run_id) {
            continue;
        }
        let terminal = event.is_terminal();
        collected.push(event);
        if terminal {
            break;
        }
    }
    collected
}

pub fn position(events: &[RunEvent], pred: impl Fn(&RunEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

pub fn started(node: &'static str) -> impl Fn(&RunEvent) -> bool {
    move |e| matches!(e, RunEvent::NodeStarted { node_id, .. } if node_id == node)
}

pub fn succeeded(node: &'static str) -> impl Fn(&RunEvent) -> bool {
    move |e| matches!(e, RunEvent::NodeSucceeded { node_id, .. } if node_id == node)
}

/// Rejects the first `failures` submissions, then delegates to a worker pool.
pub struct FlakyBackend {
    inner: WorkerPool,
    failures: AtomicU32,
}

impl FlakyBackend {
    pub fn new(config: &RuntimeConfig, failures: u32) -> Self {
        Self {
            inner: WorkerPool::new(config.worker_pool()),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl DispatchBackend for FlakyBackend {
    async fn submit(&self, job: Job) -> Result<JobHandle, DispatchError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DispatchError::Unavailable("backend offline".to_string()));
        }
        self.inner.submit(job).await
    }

    async fn cancel(&self, run_id: RunId) {
        self.inner.cancel(run_id).await
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }
}

/// Store whose writes fail: every node upsert, and the first `run_update_failures` run updates.
pub struct FlakyStore {
    pub inner: InMemoryStore,
    run_update_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(run_update_failures: u32) -> Self {
        Self {
            inner: InMemoryStore::new(),
            run_update_failures: AtomicU32::new(run_update_failures),
        }
    }
}

#[async_trait]
impl PersistenceGateway for FlakyStore {
    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, PersistenceError> {
        self.inner.load_workflow(workflow_id).await
    }

    async fn create_run(&self, run: &Run) -> Result<(), PersistenceError> {
        self.inner.create_run(run).await
    }

    async fn update_run(&self, run_id: RunId, update: &RunUpdate) -> Result<(), PersistenceError> {
        let remaining = self.run_update_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.run_update_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PersistenceError::Backend("database unavailable".to_string()));
        }
        self.inner.update_run(run_id, update).await
    }

    async fn upsert_node_record(&self, _record: &NodeExecutionRecord) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend("database unavailable".to_string()))
    }
}
