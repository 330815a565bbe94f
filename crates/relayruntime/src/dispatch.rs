//! Dispatch backend: runs node executions on a shared, bounded worker pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycore::{
    DispatchError, NodeContext, NodeExecutionError, NodeExecutor, NodeId, NodeOutput, RunId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type JobId = Uuid;

/// One unit of work: a single attempt of a single node.
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub executor: Arc<dyn NodeExecutor>,
    pub context: NodeContext,
    /// Hard limit for this attempt.
    pub timeout: Duration,
    pub reply: mpsc::UnboundedSender<JobCompletion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: JobId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt: u32,
}

/// Result of a job, delivered on the job's reply channel.
#[derive(Debug)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub result: Result<NodeOutput, NodeExecutionError>,
}

/// Accepts jobs and runs them asynchronously.
///
/// Delivery is at-least-once from the caller's point of view: the coordinator
/// may submit another attempt of the same node, and node implementations
/// must tolerate re-execution.
#[async_trait]
pub trait DispatchBackend: Send + Sync {
    /// Hand a job to the backend. May wait for capacity; never busy-spins.
    async fn submit(&self, job: Job) -> Result<JobHandle, DispatchError>;

    /// Stop jobs of a run that have not started yet and signal running ones.
    async fn cancel(&self, run_id: RunId);

    /// Number of jobs currently executing.
    fn in_flight(&self) -> usize;
}

/// What `submit` does when every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackpressureMode {
    /// `submit` waits for a free worker.
    Block,
    /// `submit` enqueues; it only waits when the queue itself is full.
    Queue { capacity: usize },
}

impl Default for BackpressureMode {
    fn default() -> Self {
        BackpressureMode::Block
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_in_flight: usize,
    pub backpressure: BackpressureMode,
    /// Longest `submit` may wait before reporting `CapacityExhausted`.
    pub submit_timeout: Duration,
}

/// Process-wide worker pool shared by every active run.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    submit_timeout: Duration,
    queue: Option<mpsc::Sender<Job>>,
    runs: Arc<Mutex<HashMap<RunId, RunRegistration>>>,
}

struct RunRegistration {
    token: CancellationToken,
    jobs: usize,
}

impl WorkerPool {
    /// Create the pool. In queue mode this spawns the queue consumer, so it
    /// must be called inside a tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let runs = Arc::new(Mutex::new(HashMap::new()));

        let queue = match config.backpressure {
            BackpressureMode::Block => None,
            BackpressureMode::Queue { capacity } => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tokio::spawn(consume_queue(rx, Arc::clone(&permits), Arc::clone(&runs)));
                Some(tx)
            }
        };

        Self {
            permits,
            max_in_flight,
            submit_timeout: config.submit_timeout,
            queue,
            runs,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Refuse all further work. Jobs already running finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    async fn register(&self, job: &Job) {
        let mut runs = self.runs.lock().await;
        runs.entry(job.run_id)
            .or_insert_with(|| RunRegistration {
                token: job.context.cancellation.clone(),
                jobs: 0,
            })
            .jobs += 1;
    }

    async fn submit_blocking(&self, job: Job) -> Result<JobHandle, DispatchError> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = tokio::select! {
            permit = acquire => permit.map_err(|_| DispatchError::Unavailable("worker pool is shut down".to_string()))?,
            _ = job.context.cancellation.cancelled() => return Err(DispatchError::Cancelled),
            _ = tokio::time::sleep(self.submit_timeout) => {
                return Err(DispatchError::CapacityExhausted {
                    waited_ms: self.submit_timeout.as_millis() as u64,
                })
            }
        };

        let handle = handle_for(&job);
        self.register(&job).await;
        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            let _permit = permit;
            run_job(job, runs).await;
        });
        Ok(handle)
    }

    async fn submit_queued(&self, queue: &mpsc::Sender<Job>, job: Job) -> Result<JobHandle, DispatchError> {
        if self.permits.is_closed() {
            return Err(DispatchError::Unavailable("worker pool is shut down".to_string()));
        }
        let handle = handle_for(&job);
        self.register(&job).await;
        let run_id = job.run_id;
        let cancellation = job.context.cancellation.clone();

        let sent = tokio::select! {
            sent = queue.send_timeout(job, self.submit_timeout) => sent.map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => DispatchError::CapacityExhausted {
                    waited_ms: self.submit_timeout.as_millis() as u64,
                },
                mpsc::error::SendTimeoutError::Closed(_) => {
                    DispatchError::Unavailable("dispatch queue is closed".to_string())
                }
            }),
            _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
        };

        if let Err(err) = sent {
            release(&self.runs, run_id).await;
            return Err(err);
        }
        Ok(handle)
    }
}

#[async_trait]
impl DispatchBackend for WorkerPool {
    async fn submit(&self, job: Job) -> Result<JobHandle, DispatchError> {
        tracing::debug!(
            "Submitting node {} attempt {} of run {}",
            job.node_id,
            job.attempt,
            job.run_id
        );
        match &self.queue {
            None => self.submit_blocking(job).await,
            Some(queue) => self.submit_queued(queue, job).await,
        }
    }

    async fn cancel(&self, run_id: RunId) {
        let runs = self.runs.lock().await;
        if let Some(registration) = runs.get(&run_id) {
            tracing::info!(
                "Cancelling {} outstanding jobs of run {}",
                registration.jobs,
                run_id
            );
            registration.token.cancel();
        }
    }

    fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.permits.available_permits())
    }
}

fn handle_for(job: &Job) -> JobHandle {
    JobHandle {
        job_id: job.id,
        run_id: job.run_id,
        node_id: job.node_id.clone(),
        attempt: job.attempt,
    }
}

async fn release(runs: &Mutex<HashMap<RunId, RunRegistration>>, run_id: RunId) {
    let mut runs = runs.lock().await;
    if let Some(registration) = runs.get_mut(&run_id) {
        registration.jobs = registration.jobs.saturating_sub(1);
        if registration.jobs == 0 {
            runs.remove(&run_id);
        }
    }
}

async fn consume_queue(
    mut rx: mpsc::Receiver<Job>,
    permits: Arc<Semaphore>,
    runs: Arc<Mutex<HashMap<RunId, RunRegistration>>>,
) {
    while let Some(job) = rx.recv().await {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("Worker pool closed; dropping queued job for node {}", job.node_id);
                reply_unavailable(job, &runs).await;
                break;
            }
        };
        let runs = Arc::clone(&runs);
        tokio::spawn(async move {
            let _permit = permit;
            run_job(job, runs).await;
        });
    }

    // Anything still queued after shutdown is answered, not lost silently.
    while let Ok(job) = rx.try_recv() {
        reply_unavailable(job, &runs).await;
    }
}

async fn reply_unavailable(job: Job, runs: &Mutex<HashMap<RunId, RunRegistration>>) {
    release(runs, job.run_id).await;
    let _ = job.reply.send(JobCompletion {
        job_id: job.id,
        run_id: job.run_id,
        node_id: job.node_id,
        attempt: job.attempt,
        started_at: Utc::now(),
        duration: Duration::ZERO,
        result: Err(NodeExecutionError::retryable("worker pool shut down before the job started")),
    });
}

/// Execute one job under its hard timeout and report the result.
async fn run_job(job: Job, runs: Arc<Mutex<HashMap<RunId, RunRegistration>>>) {
    let Job {
        id,
        run_id,
        node_id,
        attempt,
        executor,
        context,
        timeout: limit,
        reply,
    } = job;

    let started_at = Utc::now();
    let start = Instant::now();
    let result = if context.cancellation.is_cancelled() {
        Err(NodeExecutionError::Cancelled)
    } else {
        match timeout(limit, executor.execute(context)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Node {} attempt {} timed out after {:?}", node_id, attempt, limit);
                Err(NodeExecutionError::Timeout {
                    millis: limit.as_millis() as u64,
                })
            }
        }
    };
    let duration = start.elapsed();

    release(&runs, run_id).await;

    if reply
        .send(JobCompletion {
            job_id: id,
            run_id,
            node_id,
            attempt,
            started_at,
            duration,
            result,
        })
        .is_err()
    {
        tracing::debug!("Coordinator for run {} is gone; completion discarded", run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycore::{CredentialsHandle, NodeInput};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Blocks every execution until opened or cancelled.
    struct Gate {
        running: AtomicUsize,
        peak: AtomicUsize,
        open: CancellationToken,
    }

    #[async_trait]
    impl NodeExecutor for Gate {
        fn node_type(&self) -> &str {
            "gate"
        }

        async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = tokio::select! {
                _ = self.open.cancelled() => Ok(NodeOutput::single(ctx.attempt)),
                _ = ctx.cancellation.cancelled() => Err(NodeExecutionError::Cancelled),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn gate() -> Arc<Gate> {
        Arc::new(Gate {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            open: CancellationToken::new(),
        })
    }

    fn job(
        executor: Arc<dyn NodeExecutor>,
        run_id: RunId,
        node: &str,
        token: &CancellationToken,
        reply: &mpsc::UnboundedSender<JobCompletion>,
        limit: Duration,
    ) -> Job {
        Job {
            id: Uuid::new_v4(),
            run_id,
            node_id: node.to_string(),
            attempt: 1,
            executor,
            context: NodeContext {
                run_id,
                node_id: node.to_string(),
                attempt: 1,
                input: NodeInput::default(),
                config: Map::new(),
                static_data: Arc::new(Map::new()),
                credentials: CredentialsHandle::default(),
                cancellation: token.clone(),
            },
            timeout: limit,
            reply: reply.clone(),
        }
    }

    fn pool(max_in_flight: usize, backpressure: BackpressureMode, submit_timeout: Duration) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            max_in_flight,
            backpressure,
            submit_timeout,
        })
    }

    async fn wait_running(gate: &Gate, count: usize) {
        while gate.running.load(Ordering::SeqCst) < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn blocking_pool_never_exceeds_limit() {
        let pool = pool(2, BackpressureMode::Block, Duration::from_secs(30));
        let gate = gate();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run_id = Uuid::new_v4();
        let limit = Duration::from_secs(30);

        pool.submit(job(gate.clone(), run_id, "a", &token, &tx, limit)).await.unwrap();
        pool.submit(job(gate.clone(), run_id, "b", &token, &tx, limit)).await.unwrap();
        wait_running(&gate, 2).await;
        assert_eq!(pool.in_flight(), 2);

        // The third submit waits for a permit until the gate opens.
        let third = pool.submit(job(gate.clone(), run_id, "c", &token, &tx, limit));
        let opener = async {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            gate.open.cancel();
        };
        let (handle, _) = tokio::join!(third, opener);
        assert_eq!(handle.unwrap().node_id, "c");

        for _ in 0..3 {
            let completion = rx.recv().await.unwrap();
            assert!(completion.result.is_ok());
        }
        assert_eq!(gate.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_submit_gives_up_after_timeout() {
        let pool = pool(1, BackpressureMode::Block, Duration::from_millis(100));
        let gate = gate();
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let run_id = Uuid::new_v4();
        let limit = Duration::from_secs(30);

        pool.submit(job(gate.clone(), run_id, "a", &token, &tx, limit)).await.unwrap();
        let err = pool
            .submit(job(gate.clone(), run_id, "b", &token, &tx, limit))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::CapacityExhausted { waited_ms: 100 });
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_submit_stops_waiting_when_run_is_cancelled() {
        let pool = pool(1, BackpressureMode::Block, Duration::from_secs(60));
        let gate = gate();
        let (tx, _rx) = mpsc::unbounded_channel();
        let busy = CancellationToken::new();
        let waiting = CancellationToken::new();
        let limit = Duration::from_secs(30);

        pool.submit(job(gate.clone(), Uuid::new_v4(), "a", &busy, &tx, limit)).await.unwrap();
        waiting.cancel();
        let err = pool
            .submit(job(gate, Uuid::new_v4(), "b", &waiting, &tx, limit))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_is_reported() {
        let pool = pool(1, BackpressureMode::Block, Duration::from_secs(1));
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        pool.submit(job(gate(), Uuid::new_v4(), "slow", &token, &tx, Duration::from_millis(250)))
            .await
            .unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.result, Err(NodeExecutionError::Timeout { millis: 250 }));
        assert_eq!(completion.node_id, "slow");
    }

    #[tokio::test]
    async fn cancel_signals_running_jobs_of_that_run_only() {
        let pool = pool(4, BackpressureMode::Queue { capacity: 8 }, Duration::from_secs(1));
        let gate = gate();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (run_a, run_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (token_a, token_b) = (CancellationToken::new(), CancellationToken::new());
        let limit = Duration::from_secs(30);

        pool.submit(job(gate.clone(), run_a, "a", &token_a, &tx, limit)).await.unwrap();
        pool.submit(job(gate.clone(), run_b, "b", &token_b, &tx, limit)).await.unwrap();
        wait_running(&gate, 2).await;

        pool.cancel(run_a).await;
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.run_id, run_a);
        assert_eq!(completion.result, Err(NodeExecutionError::Cancelled));
        assert!(!token_b.is_cancelled());

        gate.open.cancel();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.run_id, run_b);
        assert!(completion.result.is_ok());
    }

    #[tokio::test]
    async fn queued_jobs_are_answered_and_released_on_shutdown() {
        let pool = pool(1, BackpressureMode::Queue { capacity: 4 }, Duration::from_secs(1));
        let gate = gate();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (busy_run, queued_run) = (Uuid::new_v4(), Uuid::new_v4());
        let token = CancellationToken::new();
        let limit = Duration::from_secs(30);

        pool.submit(job(gate.clone(), busy_run, "a", &token, &tx, limit)).await.unwrap();
        wait_running(&gate, 1).await;
        pool.submit(job(gate.clone(), queued_run, "b", &token, &tx, limit)).await.unwrap();
        assert!(pool.runs.lock().await.contains_key(&queued_run));

        pool.shutdown();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.node_id, "b");
        assert!(completion.result.unwrap_err().is_retryable());
        assert!(!pool.runs.lock().await.contains_key(&queued_run));
        assert!(pool.runs.lock().await.contains_key(&busy_run));

        gate.open.cancel();
        assert!(rx.recv().await.unwrap().result.is_ok());
    }

    #[tokio::test]
    async fn shut_down_pool_is_unavailable() {
        let pool = pool(1, BackpressureMode::Block, Duration::from_secs(1));
        pool.shutdown();
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = pool
            .submit(job(gate(), Uuid::new_v4(), "a", &token, &tx, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable(_)));
    }
}
