//! Graph resolution: turns a workflow definition into layered execution order.

use crate::registry::NodeRegistry;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use relaycore::{
    Connection, ConnectionKind, GraphError, MergePolicy, NodeId, NodeSpec, PortDirection,
    WorkflowDefinition,
};
use std::collections::{BTreeSet, HashMap};

/// Ordered partition of a workflow's nodes into layers.
///
/// Every node's dependencies lie in strictly earlier layers. Plans are
/// derived per run and never mutated.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    layers: Vec<Vec<NodeId>>,
    nodes: HashMap<NodeId, PlannedNode>,
}

#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub spec: NodeSpec,
    pub layer: usize,
    pub merge_policy: MergePolicy,
    /// Sorted by source node id, then ports.
    pub incoming: Vec<Connection>,
    pub outgoing: Vec<Connection>,
}

impl PlannedNode {
    pub fn is_entry(&self) -> bool {
        self.incoming.is_empty()
    }

    /// Whether an error connection routes this node's failure to a handler.
    pub fn has_error_handler(&self) -> bool {
        self.outgoing.iter().any(|c| c.kind == ConnectionKind::Error)
    }

    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.incoming.iter().map(|c| c.source_node.as_str()).collect()
    }
}

impl ExecutionPlan {
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    pub fn node(&self, node_id: &str) -> Option<&PlannedNode> {
        self.nodes.get(node_id)
    }

    pub fn layer_of(&self, node_id: &str) -> Option<usize> {
        self.nodes.get(node_id).map(|n| n.layer)
    }

    /// Node ids in execution order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.layers.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Validate a workflow graph and compute its execution plan.
///
/// Layers are extracted with Kahn's algorithm; ids inside a layer are sorted
/// ascending. Port indices and merge policies are checked against the
/// executors registered for each node type.
pub fn resolve(
    workflow: &WorkflowDefinition,
    registry: &NodeRegistry,
) -> Result<ExecutionPlan, GraphError> {
    let mut graph: DiGraph<NodeId, usize> =
        DiGraph::with_capacity(workflow.nodes.len(), workflow.connections.len());
    let mut node_to_index: HashMap<&str, NodeIndex> = HashMap::new();

    for spec in &workflow.nodes {
        let idx = graph.add_node(spec.id.clone());
        if node_to_index.insert(spec.id.as_str(), idx).is_some() {
            return Err(GraphError::DuplicateNode(spec.id.clone()));
        }
    }

    for (position, conn) in workflow.connections.iter().enumerate() {
        let lookup = |id: &NodeId| {
            node_to_index
                .get(id.as_str())
                .copied()
                .ok_or_else(|| GraphError::DanglingReference {
                    node_id: id.clone(),
                    connection: position,
                })
        };
        let from = lookup(&conn.source_node)?;
        let to = lookup(&conn.target_node)?;
        graph.add_edge(from, to, position);
    }

    let mut policies: HashMap<&str, MergePolicy> = HashMap::new();
    let mut port_counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for spec in &workflow.nodes {
        let executor = registry
            .get(&spec.node_type)
            .ok_or_else(|| GraphError::UnknownNodeType {
                node_id: spec.id.clone(),
                node_type: spec.node_type.clone(),
            })?;
        let metadata = executor.metadata();
        port_counts.insert(spec.id.as_str(), (metadata.inputs.len(), metadata.outputs.len()));
        policies.insert(spec.id.as_str(), executor.merge_policy());
    }

    for conn in &workflow.connections {
        let (_, outputs) = port_counts[conn.source_node.as_str()];
        // Error connections carry the failure, not an output port.
        if conn.kind == ConnectionKind::Main && conn.source_output >= outputs {
            return Err(GraphError::InvalidPort {
                node_id: conn.source_node.clone(),
                direction: PortDirection::Output,
                port: conn.source_output,
                available: outputs,
            });
        }
        let (inputs, _) = port_counts[conn.target_node.as_str()];
        if conn.target_input >= inputs {
            return Err(GraphError::InvalidPort {
                node_id: conn.target_node.clone(),
                direction: PortDirection::Input,
                port: conn.target_input,
                available: inputs,
            });
        }
    }

    let layers = layer_graph(&graph)?;

    let mut nodes = HashMap::with_capacity(workflow.nodes.len());
    for (layer_idx, layer) in layers.iter().enumerate() {
        for node_id in layer {
            let idx = node_to_index[node_id.as_str()];
            let mut incoming: Vec<Connection> = graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| workflow.connections[*e.weight()].clone())
                .collect();
            incoming.sort_by(|a, b| {
                (&a.source_node, a.source_output, a.target_input, a.kind == ConnectionKind::Error)
                    .cmp(&(&b.source_node, b.source_output, b.target_input, b.kind == ConnectionKind::Error))
            });
            let outgoing: Vec<Connection> = graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| workflow.connections[*e.weight()].clone())
                .collect();

            let merge_policy = policies[node_id.as_str()];
            if let MergePolicy::RequireN(required) = merge_policy {
                if required == 0 || required > incoming.len() {
                    return Err(GraphError::InvalidMergePolicy {
                        node_id: node_id.clone(),
                        required,
                        available: incoming.len(),
                    });
                }
            }

            let spec = workflow
                .find_node(node_id)
                .cloned()
                .ok_or_else(|| GraphError::DanglingReference {
                    node_id: node_id.clone(),
                    connection: 0,
                })?;

            nodes.insert(
                node_id.clone(),
                PlannedNode {
                    spec,
                    layer: layer_idx,
                    merge_policy,
                    incoming,
                    outgoing,
                },
            );
        }
    }

    tracing::debug!(
        "Resolved workflow {} into {} layers over {} nodes",
        workflow.id,
        layers.len(),
        nodes.len()
    );

    Ok(ExecutionPlan { layers, nodes })
}

/// Kahn's algorithm, extracting every zero in-degree node per round.
fn layer_graph(graph: &DiGraph<NodeId, usize>) -> Result<Vec<Vec<NodeId>>, GraphError> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.edges_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .collect();
    let mut layers = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
        let mut next = Vec::new();
        for &idx in &ready {
            for edge in graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target().index();
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    next.push(edge.target());
                }
            }
        }
        placed += ready.len();
        layers.push(ready.iter().map(|idx| graph[*idx].clone()).collect());
        ready = next;
    }

    if placed < graph.node_count() {
        return Err(GraphError::Cycle {
            nodes: cycle_members(graph),
        });
    }

    Ok(layers)
}

/// Nodes that sit on a cycle, sorted. Nodes merely downstream of a cycle are excluded.
fn cycle_members(graph: &DiGraph<NodeId, usize>) -> Vec<NodeId> {
    let mut members: Vec<NodeId> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|idx| graph[idx].clone())
        .collect();
    members.sort();
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaycore::{
        NodeContext, NodeExecutionError, NodeExecutor, NodeMetadata, NodeOutput, PortDefinition,
    };
    use std::sync::Arc;

    struct Stub {
        node_type: &'static str,
        policy: MergePolicy,
        inputs: usize,
        outputs: usize,
    }

    #[async_trait]
    impl NodeExecutor for Stub {
        fn node_type(&self) -> &str {
            self.node_type
        }

        fn metadata(&self) -> NodeMetadata {
            NodeMetadata {
                inputs: (0..self.inputs).map(|_| PortDefinition::main()).collect(),
                outputs: (0..self.outputs).map(|_| PortDefinition::main()).collect(),
                ..NodeMetadata::default()
            }
        }

        fn merge_policy(&self) -> MergePolicy {
            self.policy
        }

        async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeExecutionError> {
            Ok(NodeOutput::new())
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for (node_type, policy, inputs, outputs) in [
            ("stub", MergePolicy::RequireAll, 1, 1),
            ("any", MergePolicy::RequireAny, 1, 1),
            ("two_of", MergePolicy::RequireN(2), 1, 1),
            ("branch", MergePolicy::RequireAll, 1, 2),
        ] {
            registry.register(Arc::new(Stub {
                node_type,
                policy,
                inputs,
                outputs,
            }));
        }
        registry
    }

    fn workflow(nodes: &[&str], edges: &[(&str, &str)]) -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("test");
        for id in nodes {
            wf.add_node(NodeSpec::new(*id, "stub"));
        }
        for (from, to) in edges {
            wf.connect(*from, *to);
        }
        wf
    }

    fn assert_dependencies_precede(plan: &ExecutionPlan) {
        for id in plan.node_ids() {
            let node = plan.node(id).unwrap();
            for dep in node.dependencies() {
                assert!(
                    plan.layer_of(dep).unwrap() < node.layer,
                    "{} (layer {}) depends on {} which is not earlier",
                    id,
                    node.layer,
                    dep
                );
            }
        }
    }

    #[test]
    fn linear_chain_gets_one_node_per_layer() {
        let plan = resolve(&workflow(&["a", "b", "c"], &[("a", "b"), ("b", "c")]), &registry())
            .unwrap();
        assert_eq!(plan.layers(), &[vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_layers_are_sorted_by_id() {
        let plan = resolve(
            &workflow(
                &["d", "c", "b", "a"],
                &[("a", "c"), ("a", "b"), ("b", "d"), ("c", "d")],
            ),
            &registry(),
        )
        .unwrap();
        assert_eq!(plan.layers(), &[vec!["a"], vec!["b", "c"], vec!["d"]]);
        let incoming: Vec<&str> = plan
            .node("d")
            .unwrap()
            .incoming
            .iter()
            .map(|c| c.source_node.as_str())
            .collect();
        assert_eq!(incoming, vec!["b", "c"]);
    }

    #[test]
    fn disconnected_nodes_are_planned() {
        let plan = resolve(&workflow(&["z", "a", "b"], &[("a", "b")]), &registry()).unwrap();
        assert_eq!(plan.layers(), &[vec!["a", "z"], vec!["b"]]);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn generated_dags_respect_layer_order() {
        for seed in 1..40usize {
            let ids: Vec<String> = (0..12).map(|i| format!("n{:02}", i)).collect();
            let mut edges = Vec::new();
            for i in 0..ids.len() {
                for j in (i + 1)..ids.len() {
                    if (i * 31 + j * 17 + seed * 7) % 5 == 0 {
                        edges.push((ids[i].as_str(), ids[j].as_str()));
                    }
                }
            }
            let names: Vec<&str> = ids.iter().map(String::as_str).collect();
            let plan = resolve(&workflow(&names, &edges), &registry()).unwrap();
            assert_eq!(plan.len(), ids.len());
            assert_dependencies_precede(&plan);
        }
    }

    #[test]
    fn cycle_is_reported_with_its_members() {
        let err = resolve(
            &workflow(
                &["a", "b", "c", "d"],
                &[("a", "b"), ("b", "c"), ("c", "b"), ("c", "d")],
            ),
            &registry(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                nodes: vec!["b".to_string(), "c".to_string()]
            }
        );
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let err = resolve(&workflow(&["a"], &[("a", "a")]), &registry()).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                nodes: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let err = resolve(&workflow(&["a"], &[("a", "ghost")]), &registry()).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingReference {
                node_id: "ghost".to_string(),
                connection: 0
            }
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = resolve(&workflow(&["a", "a"], &[]), &registry()).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode("a".to_string()));
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let mut wf = workflow(&["a"], &[]);
        wf.add_node(NodeSpec::new("b", "missing.type"));
        assert!(matches!(
            resolve(&wf, &registry()),
            Err(GraphError::UnknownNodeType { node_id, .. }) if node_id == "b"
        ));
    }

    #[test]
    fn ports_are_checked_against_metadata() {
        let mut wf = WorkflowDefinition::new("ports");
        wf.add_node(NodeSpec::new("if", "branch"));
        wf.add_node(NodeSpec::new("t", "stub"));
        wf.add_node(NodeSpec::new("f", "stub"));
        wf.connect_ports("if", 0, "t", 0);
        wf.connect_ports("if", 1, "f", 0);
        assert!(resolve(&wf, &registry()).is_ok());

        wf.connect_ports("if", 2, "t", 0);
        assert!(matches!(
            resolve(&wf, &registry()),
            Err(GraphError::InvalidPort { direction: PortDirection::Output, port: 2, .. })
        ));
    }

    #[test]
    fn require_n_beyond_incoming_count_is_invalid() {
        let mut wf = workflow(&["a"], &[]);
        wf.add_node(NodeSpec::new("m", "two_of"));
        wf.connect("a", "m");
        assert_eq!(
            resolve(&wf, &registry()).unwrap_err(),
            GraphError::InvalidMergePolicy {
                node_id: "m".to_string(),
                required: 2,
                available: 1
            }
        );

        wf.add_node(NodeSpec::new("b", "stub"));
        wf.connect("b", "m");
        let plan = resolve(&wf, &registry()).unwrap();
        assert_eq!(plan.node("m").unwrap().merge_policy, MergePolicy::RequireN(2));
    }

    #[test]
    fn error_connections_mark_handlers() {
        let mut wf = workflow(&["a", "b", "h"], &[("a", "b")]);
        wf.connect_error("b", "h");
        let plan = resolve(&wf, &registry()).unwrap();
        assert!(plan.node("b").unwrap().has_error_handler());
        assert!(!plan.node("a").unwrap().has_error_handler());
        assert_eq!(plan.layer_of("h"), Some(2));
    }
}
