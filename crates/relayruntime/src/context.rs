use crate::plan::{ExecutionPlan, PlannedNode};
use chrono::Utc;
use relaycore::{
    CapturedFailure, ConnectionKind, InputItem, NodeExecutionRecord, NodeFailure, NodeId,
    NodeInput, NodeOutput, NodeStatus, RunId, SkipReason,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of a readiness check for one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready(NodeInput),
    /// Some sources are not terminal yet.
    Waiting,
    Skip(SkipReason),
}

/// Live working set of one run, owned by its coordinator.
///
/// All transitions are idempotent: applying the same transition twice
/// returns `false` the second time and changes nothing.
pub struct ExecutionContext {
    run_id: RunId,
    trigger_input: Value,
    records: BTreeMap<NodeId, NodeExecutionRecord>,
    outputs: HashMap<NodeId, NodeOutput>,
    inputs: HashMap<NodeId, NodeInput>,
    static_data: Arc<Map<String, Value>>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        run_id: RunId,
        plan: &ExecutionPlan,
        trigger_input: Value,
        static_data: Map<String, Value>,
        cancellation: CancellationToken,
    ) -> Self {
        let records = plan
            .node_ids()
            .filter_map(|id| plan.node(id))
            .map(|node| {
                (
                    node.spec.id.clone(),
                    NodeExecutionRecord::new(run_id, node.spec.id.clone(), node.spec.node_type.clone()),
                )
            })
            .collect();

        Self {
            run_id,
            trigger_input,
            records,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            static_data: Arc::new(static_data),
            cancellation,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn record(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.records.get(node_id)
    }

    /// Records sorted by node id.
    pub fn records(&self) -> impl Iterator<Item = &NodeExecutionRecord> {
        self.records.values()
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.records.get(node_id).map(|r| r.status)
    }

    pub fn output(&self, node_id: &str) -> Option<&NodeOutput> {
        self.outputs.get(node_id)
    }

    pub fn input(&self, node_id: &str) -> Option<&NodeInput> {
        self.inputs.get(node_id)
    }

    pub fn static_data(&self) -> Arc<Map<String, Value>> {
        Arc::clone(&self.static_data)
    }

    /// Node ids that are not terminal yet.
    pub fn unfinished(&self) -> Vec<NodeId> {
        self.records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// Decide whether a pending node can run, given the state of its sources.
    ///
    /// Pure with respect to the context, so repeated checks are harmless.
    pub fn readiness(&self, node: &PlannedNode) -> Readiness {
        if node.is_entry() {
            return Readiness::Ready(NodeInput::trigger(self.trigger_input.clone()));
        }

        let mut input = NodeInput::default();
        let mut populated = 0;
        let mut failed_source: Option<NodeId> = None;
        let mut cancelled_source = false;

        for conn in &node.incoming {
            let Some(source) = self.records.get(&conn.source_node) else {
                continue;
            };
            if !source.status.is_terminal() {
                return Readiness::Waiting;
            }

            match (conn.kind, source.status) {
                (ConnectionKind::Main, NodeStatus::Succeeded) => {
                    let data = self
                        .outputs
                        .get(&conn.source_node)
                        .and_then(|out| out.port(conn.source_output));
                    if let Some(data) = data {
                        populated += 1;
                        input.items.push(InputItem {
                            source_node: Some(conn.source_node.clone()),
                            source_output: conn.source_output,
                            target_input: conn.target_input,
                            data: data.clone(),
                        });
                    }
                }
                (ConnectionKind::Error, NodeStatus::Failed) => {
                    let captured = CapturedFailure {
                        node_id: source.node_id.clone(),
                        attempt: source.attempt,
                        error: source
                            .error
                            .clone()
                            .unwrap_or_else(|| NodeFailure::infrastructure("unknown failure")),
                    };
                    populated += 1;
                    input.items.push(InputItem {
                        source_node: Some(conn.source_node.clone()),
                        source_output: conn.source_output,
                        target_input: conn.target_input,
                        data: serde_json::to_value(&captured).unwrap_or(Value::Null),
                    });
                    input.failure = Some(captured);
                }
                (ConnectionKind::Main, NodeStatus::Failed) => {
                    failed_source.get_or_insert_with(|| conn.source_node.clone());
                }
                // A skipped source passes its skip cause on, whatever the connection kind.
                (_, NodeStatus::Skipped) => match &source.skip_reason {
                    Some(SkipReason::UpstreamFailed { node_id }) => {
                        failed_source.get_or_insert_with(|| node_id.clone());
                    }
                    Some(SkipReason::Cancelled) => cancelled_source = true,
                    _ => {}
                },
                _ => {}
            }
        }

        if node.merge_policy.is_satisfied(populated, node.incoming.len()) {
            return Readiness::Ready(input);
        }

        let reason = if cancelled_source {
            SkipReason::Cancelled
        } else if let Some(node_id) = failed_source {
            SkipReason::UpstreamFailed { node_id }
        } else {
            SkipReason::BranchNotTaken
        };
        Readiness::Skip(reason)
    }

    /// Pending -> Running for `attempt`, capturing the input snapshot.
    pub fn mark_running(&mut self, node_id: &str, attempt: u32, input: NodeInput) -> bool {
        let Some(record) = self.records.get_mut(node_id) else {
            return false;
        };
        if record.status != NodeStatus::Pending {
            return false;
        }
        record.status = NodeStatus::Running;
        record.attempt = attempt;
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        record.input_snapshot = Some(input.merged());
        self.inputs.insert(node_id.to_string(), input);
        true
    }

    /// Pending -> Succeeded without execution: the input is forwarded on port 0.
    pub fn mark_bypassed(&mut self, node_id: &str, input: NodeInput) -> bool {
        let Some(record) = self.records.get_mut(node_id) else {
            return false;
        };
        if record.status != NodeStatus::Pending {
            return false;
        }
        let merged = input.merged();
        let output = NodeOutput::single(merged.clone());
        let now = Utc::now();
        record.status = NodeStatus::Succeeded;
        record.started_at = Some(now);
        record.finished_at = Some(now);
        record.input_snapshot = Some(merged);
        record.output = Some(output.clone());
        self.inputs.insert(node_id.to_string(), input);
        self.outputs.insert(node_id.to_string(), output);
        true
    }

    /// Running -> Succeeded. Ignored unless `attempt` is the one in flight.
    pub fn mark_succeeded(&mut self, node_id: &str, attempt: u32, output: NodeOutput) -> bool {
        let Some(record) = self.records.get_mut(node_id) else {
            return false;
        };
        if record.status != NodeStatus::Running || record.attempt != attempt {
            return false;
        }
        if let Some(patch) = &output.static_data {
            let data = Arc::make_mut(&mut self.static_data);
            data.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        record.status = NodeStatus::Succeeded;
        record.finished_at = Some(Utc::now());
        record.error = None;
        record.output = Some(output.clone());
        self.outputs.insert(node_id.to_string(), output);
        true
    }

    /// Running -> Failed permanently.
    pub fn mark_failed(&mut self, node_id: &str, attempt: u32, failure: NodeFailure) -> bool {
        let Some(record) = self.records.get_mut(node_id) else {
            return false;
        };
        if record.status != NodeStatus::Running || record.attempt != attempt {
            return false;
        }
        record.status = NodeStatus::Failed;
        record.finished_at = Some(Utc::now());
        record.error = Some(failure);
        true
    }

    /// Running -> Pending, waiting for a scheduled re-dispatch.
    pub fn mark_retrying(&mut self, node_id: &str, attempt: u32, failure: NodeFailure) -> bool {
        let Some(record) = self.records.get_mut(node_id) else {
            return false;
        };
        if record.status != NodeStatus::Running || record.attempt != attempt {
            return false;
        }
        record.status = NodeStatus::Pending;
        record.error = Some(failure);
        true
    }

    /// Any non-terminal state -> Skipped.
    pub fn mark_skipped(&mut self, node_id: &str, reason: SkipReason) -> bool {
        let Some(record) = self.records.get_mut(node_id) else {
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }
        record.status = NodeStatus::Skipped;
        record.finished_at = Some(Utc::now());
        record.skip_reason = Some(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::resolve;
    use crate::registry::NodeRegistry;
    use async_trait::async_trait;
    use relaycore::{
        NodeContext, NodeExecutionError, NodeExecutor, NodeSpec, WorkflowDefinition,
    };
    use serde_json::json;
    use uuid::Uuid;

    struct Noop;

    #[async_trait]
    impl NodeExecutor for Noop {
        fn node_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
            Ok(NodeOutput::new())
        }
    }

    fn diamond() -> (ExecutionPlan, ExecutionContext) {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(Noop));
        let mut wf = WorkflowDefinition::new("diamond");
        for id in ["a", "b", "c", "d"] {
            wf.add_node(NodeSpec::new(id, "noop"));
        }
        wf.connect("a", "b");
        wf.connect("a", "c");
        wf.connect("b", "d");
        wf.connect("c", "d");
        let plan = resolve(&wf, &registry).unwrap();
        let ctx = ExecutionContext::new(
            Uuid::new_v4(),
            &plan,
            json!({"seed": true}),
            Map::new(),
            CancellationToken::new(),
        );
        (plan, ctx)
    }

    fn run_ok(ctx: &mut ExecutionContext, plan: &ExecutionPlan, id: &str, output: NodeOutput) {
        let Readiness::Ready(input) = ctx.readiness(plan.node(id).unwrap()) else {
            panic!("{} should be ready", id);
        };
        assert!(ctx.mark_running(id, 1, input));
        assert!(ctx.mark_succeeded(id, 1, output));
    }

    #[test]
    fn entry_nodes_receive_trigger_payload() {
        let (plan, ctx) = diamond();
        assert_eq!(
            ctx.readiness(plan.node("a").unwrap()),
            Readiness::Ready(NodeInput::trigger(json!({"seed": true})))
        );
    }

    #[test]
    fn merge_waits_for_every_source() {
        let (plan, mut ctx) = diamond();
        run_ok(&mut ctx, &plan, "a", NodeOutput::single(json!({})));
        run_ok(&mut ctx, &plan, "b", NodeOutput::single(json!({"x": 1})));
        assert_eq!(ctx.readiness(plan.node("d").unwrap()), Readiness::Waiting);

        run_ok(&mut ctx, &plan, "c", NodeOutput::single(json!({"y": 2})));
        match ctx.readiness(plan.node("d").unwrap()) {
            Readiness::Ready(input) => assert_eq!(input.merged(), json!({"x": 1, "y": 2})),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn marking_succeeded_twice_is_a_no_op() {
        let (plan, mut ctx) = diamond();
        run_ok(&mut ctx, &plan, "a", NodeOutput::single(json!({"v": 1})));
        let before = ctx.record("a").cloned();

        assert!(!ctx.mark_succeeded("a", 1, NodeOutput::single(json!({"v": 2}))));
        assert_eq!(ctx.record("a").cloned(), before);
        assert_eq!(ctx.output("a").unwrap().port(0), Some(&json!({"v": 1})));

        // Readiness of dependents is unchanged by the duplicate.
        let first = ctx.readiness(plan.node("b").unwrap());
        let second = ctx.readiness(plan.node("b").unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn stale_attempt_completion_is_ignored() {
        let (plan, mut ctx) = diamond();
        let Readiness::Ready(input) = ctx.readiness(plan.node("a").unwrap()) else {
            panic!("a should be ready");
        };
        assert!(ctx.mark_running("a", 1, input.clone()));
        assert!(ctx.mark_retrying("a", 1, NodeFailure::infrastructure("boom")));
        assert!(ctx.mark_running("a", 2, input));

        assert!(!ctx.mark_succeeded("a", 1, NodeOutput::new()));
        assert!(ctx.mark_succeeded("a", 2, NodeOutput::new()));
        assert_eq!(ctx.record("a").unwrap().attempt, 2);
    }

    #[test]
    fn failed_source_skips_dependents_transitively() {
        let (plan, mut ctx) = diamond();
        run_ok(&mut ctx, &plan, "a", NodeOutput::single(json!({})));
        let Readiness::Ready(input) = ctx.readiness(plan.node("b").unwrap()) else {
            panic!("b should be ready");
        };
        ctx.mark_running("b", 1, input);
        ctx.mark_failed("b", 1, NodeFailure::infrastructure("down"));
        run_ok(&mut ctx, &plan, "c", NodeOutput::single(json!({})));

        assert_eq!(
            ctx.readiness(plan.node("d").unwrap()),
            Readiness::Skip(SkipReason::UpstreamFailed {
                node_id: "b".to_string()
            })
        );
    }

    #[test]
    fn handler_behind_skipped_source_reports_the_original_failure() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(Noop));
        let mut wf = WorkflowDefinition::new("nested handler");
        for id in ["a", "b", "h"] {
            wf.add_node(NodeSpec::new(id, "noop"));
        }
        wf.connect("a", "b");
        wf.connect_error("b", "h");
        let plan = resolve(&wf, &registry).unwrap();
        let mut ctx = ExecutionContext::new(
            Uuid::new_v4(),
            &plan,
            json!({}),
            Map::new(),
            CancellationToken::new(),
        );

        let Readiness::Ready(input) = ctx.readiness(plan.node("a").unwrap()) else {
            panic!("a should be ready");
        };
        ctx.mark_running("a", 1, input);
        ctx.mark_failed("a", 1, NodeFailure::infrastructure("down"));
        let Readiness::Skip(reason) = ctx.readiness(plan.node("b").unwrap()) else {
            panic!("b should be skipped");
        };
        ctx.mark_skipped("b", reason);

        assert_eq!(
            ctx.readiness(plan.node("h").unwrap()),
            Readiness::Skip(SkipReason::UpstreamFailed {
                node_id: "a".to_string()
            })
        );
    }

    #[test]
    fn bypassed_node_forwards_its_input() {
        let (plan, mut ctx) = diamond();
        let Readiness::Ready(input) = ctx.readiness(plan.node("a").unwrap()) else {
            panic!("a should be ready");
        };
        assert!(ctx.mark_bypassed("a", input));
        assert!(!ctx.mark_bypassed("a", NodeInput::default()));

        let record = ctx.record("a").unwrap();
        assert_eq!(record.status, NodeStatus::Succeeded);
        assert_eq!(record.attempt, 0);
        assert_eq!(ctx.output("a").unwrap().port(0), Some(&json!({"seed": true})));
    }

    #[test]
    fn static_data_patches_are_merged() {
        let (plan, mut ctx) = diamond();
        run_ok(
            &mut ctx,
            &plan,
            "a",
            NodeOutput::single(json!({})).with_static_data("counter", 3),
        );
        assert_eq!(ctx.static_data().get("counter"), Some(&json!(3)));
    }

    #[test]
    fn skipping_is_terminal() {
        let (_plan, mut ctx) = diamond();
        assert!(ctx.mark_skipped("c", SkipReason::Cancelled));
        assert!(!ctx.mark_skipped("c", SkipReason::BranchNotTaken));
        assert_eq!(ctx.record("c").unwrap().skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(ctx.unfinished(), vec!["a", "b", "d"]);
    }
}
