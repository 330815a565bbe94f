//! Background writer that applies coordinator state changes to the persistence gateway.

use relaycore::{NodeExecutionRecord, PersistenceGateway, Run, RunId, RunUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

enum PersistOp {
    CreateRun(Run),
    UpdateRun { run_id: RunId, update: RunUpdate },
    UpsertNode(NodeExecutionRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct PersistenceRetry {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

/// Handle used by coordinators to persist records without waiting on storage.
///
/// Operations are applied in submission order. Failures are logged; failed
/// terminal run updates are retried with doubling backoff in a detached task.
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistenceWriter {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(gateway: Arc<dyn PersistenceGateway>, retry: PersistenceRetry) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(gateway, retry, rx));
        Self { tx }
    }

    pub fn create_run(&self, run: &Run) {
        self.send(PersistOp::CreateRun(run.clone()));
    }

    pub fn update_run(&self, run_id: RunId, update: RunUpdate) {
        self.send(PersistOp::UpdateRun { run_id, update });
    }

    pub fn upsert_node(&self, record: &NodeExecutionRecord) {
        self.send(PersistOp::UpsertNode(record.clone()));
    }

    /// Wait until every operation queued before this call has been attempted once.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(PersistOp::Flush(done));
        let _ = wait.await;
    }

    fn send(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            tracing::error!("Persistence writer has stopped; dropping operation");
        }
    }
}

async fn write_loop(
    gateway: Arc<dyn PersistenceGateway>,
    retry: PersistenceRetry,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::CreateRun(run) => {
                if let Err(e) = gateway.create_run(&run).await {
                    tracing::warn!("Failed to persist run {}: {}", run.run_id, e);
                }
            }
            PersistOp::UpdateRun { run_id, update } => {
                if let Err(e) = gateway.update_run(run_id, &update).await {
                    tracing::warn!("Failed to persist update of run {}: {}", run_id, e);
                    if update.is_terminal() {
                        tokio::spawn(retry_final_update(Arc::clone(&gateway), retry, run_id, update));
                    }
                }
            }
            PersistOp::UpsertNode(record) => {
                if let Err(e) = gateway.upsert_node_record(&record).await {
                    tracing::warn!(
                        "Failed to persist record of node {} in run {}: {}",
                        record.node_id,
                        record.run_id,
                        e
                    );
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Persistence writer stopped");
}

async fn retry_final_update(
    gateway: Arc<dyn PersistenceGateway>,
    retry: PersistenceRetry,
    run_id: RunId,
    update: RunUpdate,
) {
    let mut delay = retry.initial_delay;
    // The first attempt already failed in the write loop.
    for attempt in 2..=retry.max_attempts.max(1) {
        tokio::time::sleep(delay).await;
        match gateway.update_run(run_id, &update).await {
            Ok(()) => {
                tracing::info!("Persisted final status of run {} on attempt {}", run_id, attempt);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "Attempt {} to persist final status of run {} failed: {}",
                    attempt,
                    run_id,
                    e
                );
            }
        }
        delay = delay.saturating_mul(2);
    }
    tracing::error!("Giving up persisting final status of run {}", run_id);
}
