//! Workflow execution runtime
//!
//! This crate resolves workflow graphs into layered execution plans, runs
//! each workflow run under its own coordinator, and executes nodes on a
//! shared, bounded worker pool.

mod context;
mod coordinator;
mod dispatch;
mod persistence;
mod plan;
mod registry;
mod runtime;
mod store;

pub use context::{ExecutionContext, Readiness};
pub use dispatch::{
    BackpressureMode, DispatchBackend, Job, JobCompletion, JobHandle, JobId, WorkerPool,
    WorkerPoolConfig,
};
pub use persistence::{PersistenceRetry, PersistenceWriter};
pub use plan::{resolve, ExecutionPlan, PlannedNode};
pub use registry::NodeRegistry;
pub use runtime::{RelayRuntime, RuntimeConfig};
pub use store::InMemoryStore;
