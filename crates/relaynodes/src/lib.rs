//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod flow;
mod time;
mod transform;

pub use debug::DebugNode;
pub use flow::{FailNode, IfNode, MergeNode};
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode, SetNode};
use relayruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(DebugNode));
    registry.register(Arc::new(SetNode));
    registry.register(Arc::new(JsonParseNode));
    registry.register(Arc::new(JsonStringifyNode));
    registry.register(Arc::new(DelayNode));
    registry.register(Arc::new(IfNode));
    registry.register(Arc::new(MergeNode));
    registry.register(Arc::new(FailNode));
}
