//! Run coordinator: drives one run through its execution plan.
//!
//! The coordinator is the only writer of its run's state. Node work is handed
//! to the dispatch backend and comes back as completions on a channel; retry
//! backoffs come back as timer messages. Both are processed one at a time by
//! the coordination loop, so record transitions for a run are serialized.

use crate::context::{ExecutionContext, Readiness};
use crate::dispatch::{DispatchBackend, Job, JobCompletion};
use crate::persistence::PersistenceWriter;
use crate::plan::ExecutionPlan;
use crate::registry::NodeRegistry;
use crate::runtime::RuntimeConfig;
use chrono::Utc;
use relaycore::{
    BackoffStrategy, ConnectionKind, CredentialProvider, CredentialsHandle, DispatchError,
    ErrorHandling, EventPublisher, FailedNode, FailureReason, NodeContext, NodeExecutionError,
    NodeFailure, NodeId, NodeInput, NodeOutput, NodeStatus, RetryPolicy, Run, RunEvent, RunFailure, RunStatus, RunSummary,
    SkipReason, WorkflowDefinition,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a coordinator needs, assembled by the runtime.
pub(crate) struct CoordinatorParts {
    pub run: Run,
    pub workflow: Arc<WorkflowDefinition>,
    pub plan: Arc<ExecutionPlan>,
    pub registry: Arc<NodeRegistry>,
    pub backend: Arc<dyn DispatchBackend>,
    pub events: EventPublisher,
    pub persistence: PersistenceWriter,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub config: Arc<RuntimeConfig>,
    pub cancellation: CancellationToken,
    pub status: watch::Sender<Run>,
}

pub(crate) struct RunCoordinator {
    run: Run,
    workflow: Arc<WorkflowDefinition>,
    plan: Arc<ExecutionPlan>,
    registry: Arc<NodeRegistry>,
    backend: Arc<dyn DispatchBackend>,
    events: EventPublisher,
    persistence: PersistenceWriter,
    credentials: Option<Arc<dyn CredentialProvider>>,
    config: Arc<RuntimeConfig>,
    status: watch::Sender<Run>,
    ctx: ExecutionContext,

    // Unbounded so workers never block while holding a pool permit.
    completion_tx: mpsc::UnboundedSender<JobCompletion>,
    completions: mpsc::UnboundedReceiver<JobCompletion>,
    retry_tx: mpsc::UnboundedSender<(NodeId, u32)>,
    retries: mpsc::UnboundedReceiver<(NodeId, u32)>,

    /// Node -> attempt currently executing on the backend.
    in_flight: HashMap<NodeId, u32>,
    /// Node -> attempt waiting for its backoff to elapse.
    retry_pending: HashMap<NodeId, u32>,
    infra_failures: HashMap<NodeId, u32>,
    unhandled: Vec<FailedNode>,
    /// Failures routed to error handlers, re-checked once the run settles.
    routed: Vec<(FailedNode, bool)>,
    infra_failed: bool,
    halted: bool,
    started: Instant,
}

impl RunCoordinator {
    pub(crate) fn new(parts: CoordinatorParts) -> Self {
        let ctx = ExecutionContext::new(
            parts.run.run_id,
            &parts.plan,
            parts.run.trigger_input.clone(),
            parts.workflow.static_data.clone(),
            parts.cancellation,
        );
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (retry_tx, retries) = mpsc::unbounded_channel();

        Self {
            run: parts.run,
            workflow: parts.workflow,
            plan: parts.plan,
            registry: parts.registry,
            backend: parts.backend,
            events: parts.events,
            persistence: parts.persistence,
            credentials: parts.credentials,
            config: parts.config,
            status: parts.status,
            ctx,
            completion_tx,
            completions,
            retry_tx,
            retries,
            in_flight: HashMap::new(),
            retry_pending: HashMap::new(),
            infra_failures: HashMap::new(),
            unhandled: Vec::new(),
            routed: Vec::new(),
            infra_failed: false,
            halted: false,
            started: Instant::now(),
        }
    }

    /// Drive the run to a terminal state and report its summary.
    pub(crate) async fn run(mut self) -> RunSummary {
        self.start();

        let plan = Arc::clone(&self.plan);
        for (index, layer) in plan.layers().iter().enumerate() {
            if self.ctx.is_cancelled() {
                break;
            }
            tracing::debug!(
                "Run {} entering layer {} with {} nodes",
                self.run.run_id,
                index,
                layer.len()
            );
            for node_id in layer {
                if self.ctx.is_cancelled() {
                    break;
                }
                self.schedule(node_id).await;
            }
            self.drain_layer().await;
        }

        if self.ctx.is_cancelled() {
            self.drain_cancelled().await;
        }

        self.finish().await
    }

    fn start(&mut self) {
        for record in self.ctx.records() {
            self.persistence.upsert_node(record);
        }
        self.transition(RunStatus::Running);
        tracing::info!(
            "Starting run {} of workflow {} ({} nodes in {} layers)",
            self.run.run_id,
            self.workflow.id,
            self.plan.len(),
            self.plan.layers().len()
        );
        self.events.publish(RunEvent::RunStarted {
            run_id: self.run.run_id,
            workflow_id: self.workflow.id,
            timestamp: Utc::now(),
        });
    }

    async fn schedule(&mut self, node_id: &str) {
        let plan = Arc::clone(&self.plan);
        let Some(node) = plan.node(node_id) else {
            return;
        };

        if self.halted {
            self.skip(node_id, SkipReason::RunHalted);
            return;
        }

        match self.ctx.readiness(node) {
            Readiness::Ready(input) if node.spec.disabled => self.bypass(node_id, input),
            Readiness::Ready(input) => self.dispatch(node_id, input, 1).await,
            Readiness::Skip(reason) => {
                tracing::debug!("Skipping node {} in run {}: {:?}", node_id, self.run.run_id, reason);
                self.skip(node_id, reason);
            }
            Readiness::Waiting => {
                // Earlier layers are fully drained before a layer is scheduled.
                tracing::error!(
                    "Node {} in run {} scheduled before its sources finished",
                    node_id,
                    self.run.run_id
                );
                self.skip(node_id, SkipReason::RunHalted);
            }
        }
    }

    /// Disabled nodes forward their input without running.
    fn bypass(&mut self, node_id: &str, input: NodeInput) {
        if !self.ctx.mark_bypassed(node_id, input) {
            return;
        }
        tracing::debug!("Node {} in run {} is disabled; passing input through", node_id, self.run.run_id);
        self.persist_record(node_id);
        let output = self
            .ctx
            .output(node_id)
            .map(NodeOutput::to_value)
            .unwrap_or_default();
        self.events.publish(RunEvent::NodeSucceeded {
            run_id: self.run.run_id,
            node_id: node_id.to_string(),
            attempt: 0,
            output,
            duration_ms: 0,
            timestamp: Utc::now(),
        });
    }

    async fn dispatch(&mut self, node_id: &str, input: NodeInput, attempt: u32) {
        let plan = Arc::clone(&self.plan);
        let Some(node) = plan.node(node_id) else {
            return;
        };
        let spec = &node.spec;

        if !self.ctx.mark_running(node_id, attempt, input.clone()) {
            return;
        }

        let Some(executor) = self.registry.get(&spec.node_type) else {
            let err = NodeExecutionError::Configuration(format!(
                "node type {} is not registered",
                spec.node_type
            ));
            self.fail_node(node_id, attempt, NodeFailure::from(&err), false);
            return;
        };

        let context = NodeContext {
            run_id: self.run.run_id,
            node_id: node_id.to_string(),
            attempt,
            input,
            config: spec.config.clone(),
            static_data: self.ctx.static_data(),
            credentials: CredentialsHandle::new(spec.credentials.clone(), self.credentials.clone()),
            cancellation: self.ctx.cancellation().clone(),
        };
        let job = Job {
            id: Uuid::new_v4(),
            run_id: self.run.run_id,
            node_id: node_id.to_string(),
            attempt,
            executor,
            context,
            timeout: self.node_timeout(node_id),
            reply: self.completion_tx.clone(),
        };

        match self.backend.submit(job).await {
            Ok(handle) => {
                tracing::debug!(
                    "Dispatched node {} attempt {} of run {} as job {}",
                    node_id,
                    attempt,
                    self.run.run_id,
                    handle.job_id
                );
                self.in_flight.insert(node_id.to_string(), attempt);
                self.persist_record(node_id);
                self.events.publish(RunEvent::NodeStarted {
                    run_id: self.run.run_id,
                    node_id: node_id.to_string(),
                    node_type: spec.node_type.clone(),
                    attempt,
                    timestamp: Utc::now(),
                });
            }
            Err(DispatchError::Cancelled) => self.skip(node_id, SkipReason::Cancelled),
            Err(err) => self.on_dispatch_error(node_id, attempt, err),
        }
    }

    /// Wait until every node of the current layer is terminal, or cancellation.
    async fn drain_layer(&mut self) {
        let token = self.ctx.cancellation().clone();
        while !(self.in_flight.is_empty() && self.retry_pending.is_empty()) {
            if token.is_cancelled() {
                return;
            }
            tokio::select! {
                Some(completion) = self.completions.recv() => self.on_completion(completion).await,
                Some((node_id, attempt)) = self.retries.recv() => self.on_retry_due(node_id, attempt).await,
                _ = token.cancelled() => return,
            }
        }
    }

    async fn on_completion(&mut self, completion: JobCompletion) {
        let JobCompletion {
            node_id,
            attempt,
            duration,
            result,
            ..
        } = completion;

        if self.in_flight.get(&node_id) != Some(&attempt) {
            tracing::debug!(
                "Ignoring stale completion of node {} attempt {} in run {}",
                node_id,
                attempt,
                self.run.run_id
            );
            return;
        }
        self.in_flight.remove(&node_id);

        match result {
            Ok(output) => self.succeed(&node_id, attempt, output, duration),
            Err(NodeExecutionError::Cancelled) if self.ctx.is_cancelled() => {
                self.skip(&node_id, SkipReason::Cancelled)
            }
            Err(err) => self.on_node_error(&node_id, attempt, err),
        }
    }

    fn succeed(&mut self, node_id: &str, attempt: u32, output: NodeOutput, duration: Duration) {
        let payload = output.to_value();
        if !self.ctx.mark_succeeded(node_id, attempt, output) {
            return;
        }
        tracing::info!(
            "Node {} completed in {}ms (run {}, attempt {})",
            node_id,
            duration.as_millis(),
            self.run.run_id,
            attempt
        );
        self.persist_record(node_id);
        self.events.publish(RunEvent::NodeSucceeded {
            run_id: self.run.run_id,
            node_id: node_id.to_string(),
            attempt,
            output: payload,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }

    fn on_node_error(&mut self, node_id: &str, attempt: u32, err: NodeExecutionError) {
        let policy = self.retry_policy(node_id);
        let failure = NodeFailure::from(&err);

        if err.is_retryable() && attempt < policy.max_attempts && !self.ctx.is_cancelled() {
            if self.halted {
                tracing::info!(
                    "Node {} attempt {} failed in halted run {}; not retrying",
                    node_id,
                    attempt,
                    self.run.run_id
                );
                self.skip(node_id, SkipReason::RunHalted);
                return;
            }
            let delay = policy.delay_after(attempt);
            tracing::warn!(
                "Node {} attempt {}/{} failed in run {}: {}; retrying in {:?}",
                node_id,
                attempt,
                policy.max_attempts,
                self.run.run_id,
                err,
                delay
            );
            self.retry(node_id, attempt, attempt + 1, delay, failure);
        } else {
            tracing::error!(
                "Node {} failed in run {} after {} attempt(s): {}",
                node_id,
                self.run.run_id,
                attempt,
                err
            );
            self.fail_node(node_id, attempt, failure, false);
        }
    }

    fn on_dispatch_error(&mut self, node_id: &str, attempt: u32, err: DispatchError) {
        let failures = self.infra_failures.entry(node_id.to_string()).or_insert(0);
        *failures += 1;
        let count = *failures;
        let failure = NodeFailure::infrastructure(err.to_string());

        if count <= self.config.max_infra_retries && !self.ctx.is_cancelled() {
            let delay = BackoffStrategy::Exponential {
                initial_ms: self.config.infra_retry_delay_ms,
                multiplier: 2.0,
                max_ms: None,
            }
            .delay_after(count);
            tracing::warn!(
                "Dispatch of node {} in run {} failed ({}/{}): {}; retrying in {:?}",
                node_id,
                self.run.run_id,
                count,
                self.config.max_infra_retries,
                err,
                delay
            );
            // Infrastructure retries do not consume node attempts.
            self.retry(node_id, attempt, attempt, delay, failure);
        } else {
            tracing::error!(
                "Giving up dispatching node {} in run {}: {}",
                node_id,
                self.run.run_id,
                err
            );
            self.fail_node(node_id, attempt, failure, true);
        }
    }

    fn retry(&mut self, node_id: &str, attempt: u32, next_attempt: u32, delay: Duration, failure: NodeFailure) {
        if !self.ctx.mark_retrying(node_id, attempt, failure.clone()) {
            return;
        }
        self.persist_record(node_id);
        self.events.publish(RunEvent::NodeRetried {
            run_id: self.run.run_id,
            node_id: node_id.to_string(),
            next_attempt,
            delay_ms: delay.as_millis() as u64,
            error: failure,
            timestamp: Utc::now(),
        });

        self.retry_pending.insert(node_id.to_string(), next_attempt);
        let tx = self.retry_tx.clone();
        let token = self.ctx.cancellation().clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send((node_id, next_attempt));
                }
                _ = token.cancelled() => {}
            }
        });
    }

    async fn on_retry_due(&mut self, node_id: NodeId, attempt: u32) {
        if self.retry_pending.get(&node_id) != Some(&attempt) {
            return;
        }
        self.retry_pending.remove(&node_id);
        if self.halted {
            self.skip(&node_id, SkipReason::RunHalted);
            return;
        }
        let input = self.ctx.input(&node_id).cloned().unwrap_or_default();
        self.dispatch(&node_id, input, attempt).await;
    }

    fn fail_node(&mut self, node_id: &str, attempt: u32, failure: NodeFailure, infrastructure: bool) {
        if !self.ctx.mark_failed(node_id, attempt, failure.clone()) {
            return;
        }
        self.persist_record(node_id);
        self.events.publish(RunEvent::NodeFailed {
            run_id: self.run.run_id,
            node_id: node_id.to_string(),
            attempt,
            error: failure.clone(),
            timestamp: Utc::now(),
        });

        let failed = FailedNode {
            node_id: node_id.to_string(),
            error: failure,
        };
        let handled = self
            .plan
            .node(node_id)
            .map(|n| n.has_error_handler())
            .unwrap_or(false);
        if handled {
            tracing::info!(
                "Failure of node {} in run {} is routed to its error handler",
                node_id,
                self.run.run_id
            );
            self.routed.push((failed, infrastructure));
            return;
        }

        self.unhandled.push(failed);
        self.infra_failed |= infrastructure;
        if self.error_handling(node_id) == ErrorHandling::StopRun && !self.halted {
            tracing::warn!(
                "Run {} halted after unhandled failure of node {}",
                self.run.run_id,
                node_id
            );
            self.halt();
        }
    }

    /// Stop dispatching; nodes waiting on a retry backoff will not run again.
    fn halt(&mut self) {
        self.halted = true;
        let waiting: Vec<NodeId> = self.retry_pending.drain().map(|(id, _)| id).collect();
        for node_id in waiting {
            self.skip(&node_id, SkipReason::RunHalted);
        }
    }

    /// Routed failures whose every handler ended up skipped count as unhandled.
    fn collect_unreached_handlers(&mut self) {
        let plan = Arc::clone(&self.plan);
        for (failed, infrastructure) in std::mem::take(&mut self.routed) {
            let reached = plan
                .node(&failed.node_id)
                .map(|node| {
                    node.outgoing
                        .iter()
                        .filter(|c| c.kind == ConnectionKind::Error)
                        .any(|c| self.ctx.status(&c.target_node) != Some(NodeStatus::Skipped))
                })
                .unwrap_or(false);
            if reached {
                continue;
            }
            tracing::warn!(
                "No error handler of node {} ran in run {}; failure is unhandled",
                failed.node_id,
                self.run.run_id
            );
            self.unhandled.push(failed);
            self.infra_failed |= infrastructure;
        }
    }

    fn skip(&mut self, node_id: &str, reason: SkipReason) {
        if !self.ctx.mark_skipped(node_id, reason.clone()) {
            return;
        }
        self.persist_record(node_id);
        self.events.publish(RunEvent::NodeSkipped {
            run_id: self.run.run_id,
            node_id: node_id.to_string(),
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Stop dispatching, let in-flight work drain, then abandon what is left.
    async fn drain_cancelled(&mut self) {
        tracing::info!(
            "Cancelling run {}: {} nodes in flight, {} awaiting retry",
            self.run.run_id,
            self.in_flight.len(),
            self.retry_pending.len()
        );
        self.backend.cancel(self.run.run_id).await;

        let waiting: Vec<NodeId> = self.retry_pending.drain().map(|(id, _)| id).collect();
        for node_id in waiting {
            self.skip(&node_id, SkipReason::Cancelled);
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.cancel_drain_timeout_ms);
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.completions.recv()).await {
                Ok(Some(completion)) => self.on_completion(completion).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "{} nodes of run {} ignored cancellation; abandoning them",
                        self.in_flight.len(),
                        self.run.run_id
                    );
                    break;
                }
            }
        }

        let abandoned: Vec<NodeId> = self.in_flight.drain().map(|(id, _)| id).collect();
        for node_id in abandoned {
            self.skip(&node_id, SkipReason::Cancelled);
        }
    }

    async fn finish(mut self) -> RunSummary {
        let cancelled = self.ctx.is_cancelled();
        let leftover = if cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::RunHalted
        };
        for node_id in self.ctx.unfinished() {
            self.skip(&node_id, leftover.clone());
        }
        self.collect_unreached_handlers();

        let status = if cancelled {
            RunStatus::Cancelled
        } else if !self.unhandled.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        if status == RunStatus::Failed {
            self.run.failure = Some(RunFailure {
                reason: if self.infra_failed {
                    FailureReason::InfrastructureFailure
                } else {
                    FailureReason::NodeFailures
                },
                nodes: self.unhandled.clone(),
            });
        }
        self.transition(status);
        self.persistence.flush().await;

        let summary = RunSummary {
            run: self.run.clone(),
            records: self.ctx.records().cloned().collect(),
        };
        let duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(
            "Run {} finished as {:?} in {}ms",
            self.run.run_id,
            status,
            duration_ms
        );

        let run_id = self.run.run_id;
        let timestamp = Utc::now();
        self.events.publish(match status {
            RunStatus::Cancelled => RunEvent::RunCancelled {
                run_id,
                completed_nodes: summary.completed_nodes(),
                skipped_nodes: summary.skipped_nodes(),
                timestamp,
            },
            RunStatus::Failed => RunEvent::RunFailed {
                run_id,
                reason: self
                    .run
                    .failure
                    .as_ref()
                    .map(|f| f.reason)
                    .unwrap_or(FailureReason::NodeFailures),
                failed_nodes: self.unhandled.clone(),
                duration_ms,
                timestamp,
            },
            _ => RunEvent::RunSucceeded {
                run_id,
                duration_ms,
                timestamp,
            },
        });

        summary
    }

    fn transition(&mut self, next: RunStatus) {
        if !self.run.transition(next) {
            tracing::warn!(
                "Ignoring invalid transition of run {} from {:?} to {:?}",
                self.run.run_id,
                self.run.status,
                next
            );
            return;
        }
        self.status.send_replace(self.run.clone());
        self.persistence
            .update_run(self.run.run_id, self.run.status_update());
    }

    fn persist_record(&self, node_id: &str) {
        if let Some(record) = self.ctx.record(node_id) {
            self.persistence.upsert_node(record);
        }
    }

    fn retry_policy(&self, node_id: &str) -> RetryPolicy {
        self.plan
            .node(node_id)
            .and_then(|n| n.spec.retry_policy.clone())
            .or_else(|| self.workflow.settings.default_retry.clone())
            .unwrap_or_else(|| self.config.default_retry.clone())
    }

    fn error_handling(&self, node_id: &str) -> ErrorHandling {
        self.plan
            .node(node_id)
            .and_then(|n| n.spec.on_error)
            .unwrap_or(self.workflow.settings.on_error)
    }

    fn node_timeout(&self, node_id: &str) -> Duration {
        let millis = self
            .plan
            .node(node_id)
            .and_then(|n| n.spec.timeout_ms)
            .or(self.workflow.settings.node_timeout_ms)
            .unwrap_or(self.config.node_timeout_ms);
        Duration::from_millis(millis)
    }
}
