use crate::{FailedNode, FailureReason, NodeFailure, NodeId, RunId, SkipReason, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Lifecycle events published while runs execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        run_id: RunId,
        node_id: NodeId,
        node_type: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeSucceeded {
        run_id: RunId,
        node_id: NodeId,
        attempt: u32,
        output: Value,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunId,
        node_id: NodeId,
        attempt: u32,
        error: NodeFailure,
        timestamp: DateTime<Utc>,
    },
    NodeRetried {
        run_id: RunId,
        node_id: NodeId,
        /// The attempt that will run next.
        next_attempt: u32,
        delay_ms: u64,
        error: NodeFailure,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        run_id: RunId,
        node_id: NodeId,
        reason: SkipReason,
        timestamp: DateTime<Utc>,
    },
    RunSucceeded {
        run_id: RunId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        reason: FailureReason,
        failed_nodes: Vec<FailedNode>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        run_id: RunId,
        completed_nodes: Vec<NodeId>,
        skipped_nodes: Vec<NodeId>,
        timestamp: DateTime<Utc>,
    },
    /// Marker delivered in place of events a slow subscriber missed.
    EventsDropped {
        run_id: Option<RunId>,
        dropped: u64,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::NodeStarted { run_id, .. }
            | RunEvent::NodeSucceeded { run_id, .. }
            | RunEvent::NodeFailed { run_id, .. }
            | RunEvent::NodeRetried { run_id, .. }
            | RunEvent::NodeSkipped { run_id, .. }
            | RunEvent::RunSucceeded { run_id, .. }
            | RunEvent::RunFailed { run_id, .. }
            | RunEvent::RunCancelled { run_id, .. } => Some(*run_id),
            RunEvent::EventsDropped { run_id, .. } => *run_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            RunEvent::NodeStarted { node_id, .. }
            | RunEvent::NodeSucceeded { node_id, .. }
            | RunEvent::NodeFailed { node_id, .. }
            | RunEvent::NodeRetried { node_id, .. }
            | RunEvent::NodeSkipped { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunSucceeded { .. } | RunEvent::RunFailed { .. } | RunEvent::RunCancelled { .. }
        )
    }
}

/// Fire-and-forget publisher shared by all runs.
///
/// Each open run has its own broadcast channel, so a busy run never pushes
/// another run's events out of its subscribers' window. A second channel
/// carries every event for `subscribe_all`. A subscriber that falls behind
/// loses the oldest events of its channel and receives a single
/// `EventsDropped` marker instead; publishers never wait.
#[derive(Clone)]
pub struct EventPublisher {
    all: broadcast::Sender<RunEvent>,
    runs: Arc<Mutex<HashMap<RunId, broadcast::Sender<RunEvent>>>>,
    capacity: usize,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            all,
            runs: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    fn run_channels(&self) -> MutexGuard<'_, HashMap<RunId, broadcast::Sender<RunEvent>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the channel of `run_id`. It closes after the run's terminal event.
    pub fn open(&self, run_id: RunId) {
        self.run_channels()
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    pub fn publish(&self, event: RunEvent) {
        if let Some(run_id) = event.run_id() {
            let mut runs = self.run_channels();
            if let Some(sender) = runs.get(&run_id) {
                let _ = sender.send(event.clone());
            }
            if event.is_terminal() {
                runs.remove(&run_id);
            }
        }
        // No subscribers is not an error.
        if self.all.send(event).is_err() {
            tracing::trace!("event published without subscribers");
        }
    }

    /// Events of one run, in publication order.
    ///
    /// The subscription ends after the run's terminal event. Subscribing to a
    /// run that is not open yields an already finished subscription.
    pub fn subscribe(&self, run_id: RunId) -> EventSubscription {
        let receiver = match self.run_channels().get(&run_id) {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).0.subscribe(),
        };
        EventSubscription {
            receiver,
            run_id: Some(run_id),
        }
    }

    /// Events of every run.
    pub fn subscribe_all(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.all.subscribe(),
            run_id: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.all.receiver_count()
            + self
                .run_channels()
                .values()
                .map(|sender| sender.receiver_count())
                .sum::<usize>()
    }

    /// Runs whose channel is still open.
    pub fn open_runs(&self) -> usize {
        self.run_channels().len()
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<RunEvent>,
    run_id: Option<RunId>,
}

impl EventSubscription {
    fn dropped_marker(&self, dropped: u64) -> RunEvent {
        RunEvent::EventsDropped {
            run_id: self.run_id,
            dropped,
            timestamp: Utc::now(),
        }
    }

    /// Next event, or `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(dropped)) => Some(self.dropped_marker(dropped)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(dropped)) => Some(self.dropped_marker(dropped)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<RunEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
