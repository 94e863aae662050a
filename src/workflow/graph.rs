//! Directed-graph view of a deployed process definition.
//!
//! Flow nodes are the graph's vertices and transitions its edges. Boundary events are
//! linked to the activity they are attached to, so reachability follows the paths a
//! token could take through an interrupting or non-interrupting boundary.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use petgraph::{
    Direction,
    algo::has_path_connecting,
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
};

use crate::{
    ProcflowError, Result,
    model::{EventTrigger, FlowNodeDefinition, FlowNodeKind, FlowNodeType, ProcessDefinition, TransitionDefinition},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// Index into the definition's transitions.
    Transition(usize),
    /// Activity to one of its boundary events.
    Boundary,
}

#[derive(Debug)]
pub struct ProcessGraph {
    definition: Arc<ProcessDefinition>,
    graph: DiGraph<usize, Link>,
    indices: HashMap<String, NodeIndex>,
}

impl TryFrom<Arc<ProcessDefinition>> for ProcessGraph {
    type Error = ProcflowError;

    fn try_from(definition: Arc<ProcessDefinition>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for (pos, node) in definition.flow_nodes.iter().enumerate() {
            if indices.contains_key(&node.id) {
                return Err(ProcflowError::Definition(format!("duplicate flow node id '{}'", node.id)));
            }
            indices.insert(node.id.clone(), graph.add_node(pos));
        }

        let mut transition_ids = HashSet::new();
        for (pos, transition) in definition.transitions.iter().enumerate() {
            if !transition_ids.insert(transition.id.as_str()) {
                return Err(ProcflowError::Definition(format!("duplicate transition id '{}'", transition.id)));
            }
            let source = indices
                .get(&transition.source)
                .ok_or_else(|| ProcflowError::Definition(format!("transition '{}' has unknown source '{}'", transition.id, transition.source)))?;
            let target = indices
                .get(&transition.target)
                .ok_or_else(|| ProcflowError::Definition(format!("transition '{}' has unknown target '{}'", transition.id, transition.target)))?;
            graph.add_edge(*source, *target, Link::Transition(pos));
        }

        for node in &definition.flow_nodes {
            match &node.kind {
                FlowNodeKind::BoundaryEvent {
                    attached_to,
                    trigger,
                    ..
                } => {
                    let activity = definition
                        .flow_node(attached_to)
                        .ok_or_else(|| ProcflowError::Definition(format!("boundary event '{}' is attached to unknown node '{}'", node.id, attached_to)))?;
                    if !activity.node_type().is_activity() {
                        return Err(ProcflowError::Definition(format!("boundary event '{}' must be attached to an activity", node.id)));
                    }
                    if let EventTrigger::Timer {
                        cycle: Some(_),
                        ..
                    } = trigger
                    {
                        return Err(ProcflowError::Definition(format!("boundary event '{}' cannot use a cycle timer", node.id)));
                    }
                    graph.add_edge(indices[attached_to], indices[&node.id], Link::Boundary);
                }
                FlowNodeKind::ExclusiveGateway {
                    default_transition: Some(default),
                }
                | FlowNodeKind::InclusiveGateway {
                    default_transition: Some(default),
                } => {
                    let owned = definition.transitions.iter().any(|t| &t.id == default && t.source == node.id);
                    if !owned {
                        return Err(ProcflowError::Definition(format!("default transition '{}' does not leave gateway '{}'", default, node.id)));
                    }
                }
                FlowNodeKind::UserTask {
                    actor,
                    ..
                } => {
                    if definition.actor(actor).is_none() {
                        return Err(ProcflowError::Definition(format!("user task '{}' references unknown actor '{}'", node.id, actor)));
                    }
                }
                _ => {}
            }

            let idx = indices[&node.id];
            let entry = matches!(node.node_type(), FlowNodeType::StartEvent | FlowNodeType::BoundaryEvent);
            if entry && graph.edges_directed(idx, Direction::Incoming).any(|e| matches!(e.weight(), Link::Transition(_))) {
                return Err(ProcflowError::Definition(format!("'{}' cannot have incoming transitions", node.id)));
            }
        }

        if !definition.flow_nodes.iter().any(|n| n.node_type() == FlowNodeType::StartEvent) {
            return Err(ProcflowError::Definition(format!("process '{}' has no start event", definition.name)));
        }

        Ok(Self {
            definition,
            graph,
            indices,
        })
    }
}

impl ProcessGraph {
    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn flow_node(
        &self,
        id: &str,
    ) -> Result<&FlowNodeDefinition> {
        self.indices
            .get(id)
            .map(|idx| &self.definition.flow_nodes[self.graph[*idx]])
            .ok_or_else(|| ProcflowError::Definition(format!("flow node '{}' not found in '{}'", id, self.definition.name)))
    }

    pub fn transition(
        &self,
        id: &str,
    ) -> Option<&TransitionDefinition> {
        self.definition.transitions.iter().find(|t| t.id == id)
    }

    pub fn start_events(&self) -> Vec<&FlowNodeDefinition> {
        self.definition.flow_nodes.iter().filter(|n| n.node_type() == FlowNodeType::StartEvent).collect()
    }

    /// Start events without a trigger, used by a manual start.
    pub fn none_start_events(&self) -> Vec<&FlowNodeDefinition> {
        self.definition
            .flow_nodes
            .iter()
            .filter(|n| {
                matches!(n.kind, FlowNodeKind::StartEvent {
                    trigger: None
                })
            })
            .collect()
    }

    pub fn timer_start_events(&self) -> Vec<&FlowNodeDefinition> {
        self.definition
            .flow_nodes
            .iter()
            .filter(|n| matches!(&n.kind, FlowNodeKind::StartEvent { trigger: Some(t) } if t.is_timer()))
            .collect()
    }

    /// Outgoing transitions in definition order.
    pub fn outgoing(
        &self,
        id: &str,
    ) -> Vec<&TransitionDefinition> {
        self.transitions(id, Direction::Outgoing)
    }

    pub fn incoming(
        &self,
        id: &str,
    ) -> Vec<&TransitionDefinition> {
        self.transitions(id, Direction::Incoming)
    }

    pub fn incoming_count(
        &self,
        id: &str,
    ) -> usize {
        self.incoming(id).len()
    }

    pub fn boundary_events_of(
        &self,
        activity_id: &str,
    ) -> Vec<&FlowNodeDefinition> {
        let Some(idx) = self.indices.get(activity_id) else {
            return vec![];
        };
        let mut boundaries: Vec<usize> = self
            .graph
            .edges_directed(*idx, Direction::Outgoing)
            .filter(|e| *e.weight() == Link::Boundary)
            .map(|e| self.graph[e.target()])
            .collect();
        boundaries.sort();
        boundaries.into_iter().map(|pos| &self.definition.flow_nodes[pos]).collect()
    }

    /// Whether a token at `from` could still arrive at `to`.
    pub fn can_reach(
        &self,
        from: &str,
        to: &str,
    ) -> bool {
        match (self.indices.get(from), self.indices.get(to)) {
            (Some(a), Some(b)) => has_path_connecting(&self.graph, *a, *b, None),
            _ => false,
        }
    }

    fn transitions(
        &self,
        id: &str,
        direction: Direction,
    ) -> Vec<&TransitionDefinition> {
        let Some(idx) = self.indices.get(id) else {
            return vec![];
        };
        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(*idx, direction)
            .filter_map(|e| match e.weight() {
                Link::Transition(pos) => Some(*pos),
                Link::Boundary => None,
            })
            .collect();
        positions.sort();
        positions.into_iter().map(|pos| &self.definition.transitions[pos]).collect()
    }

    /// Output a human-readable representation of the process graph
    pub fn schema(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("=== Process Graph: {} ({}) ===", self.definition.name, self.definition.version));
        lines.push(format!("Flow nodes: {}, Links: {}", self.graph.node_count(), self.graph.edge_count()));
        lines.push(String::new());

        lines.push("--- Flow Nodes ---".to_string());
        for node in &self.definition.flow_nodes {
            lines.push(format!("[{}] {} (type: {})", node.id, node.display_name(), node.node_type().as_ref()));
        }
        lines.push(String::new());

        lines.push("--- Graph Structure ---".to_string());
        for node in &self.definition.flow_nodes {
            let outgoing: Vec<String> = self.outgoing(&node.id).iter().map(|t| format!("{}({})", t.target, t.id)).collect();
            let boundaries: Vec<String> = self.boundary_events_of(&node.id).iter().map(|b| format!("~{}", b.id)).collect();
            let all = [outgoing, boundaries].concat();
            if all.is_empty() {
                lines.push(format!("{} -> (end)", node.id));
            } else {
                lines.push(format!("{} -> {}", node.id, all.join(", ")));
            }
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(json: &str) -> Result<ProcessGraph> {
        ProcessGraph::try_from(Arc::new(ProcessDefinition::from_json(json)?))
    }

    const DIAMOND: &str = r#"{
        "name": "diamond",
        "version": "1",
        "flow_nodes": [
            { "id": "start", "type": "start_event" },
            { "id": "split", "type": "parallel_gateway" },
            { "id": "a", "type": "automatic_task" },
            { "id": "b", "type": "receive_task", "message": "go" },
            { "id": "b_timeout", "type": "boundary_event", "attached_to": "b", "trigger": { "type": "timer", "duration_ms": 100 } },
            { "id": "join", "type": "parallel_gateway" },
            { "id": "end", "type": "end_event" },
            { "id": "late", "type": "end_event" }
        ],
        "transitions": [
            { "id": "t1", "source": "start", "target": "split" },
            { "id": "t2", "source": "split", "target": "a" },
            { "id": "t3", "source": "split", "target": "b" },
            { "id": "t4", "source": "a", "target": "join" },
            { "id": "t5", "source": "b", "target": "join" },
            { "id": "t6", "source": "join", "target": "end" },
            { "id": "t7", "source": "b_timeout", "target": "late" }
        ]
    }"#;

    #[test]
    fn test_structure() {
        let g = graph(DIAMOND).unwrap();
        assert_eq!(g.outgoing("split").iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["t2", "t3"]);
        assert_eq!(g.incoming_count("join"), 2);
        assert_eq!(g.incoming_count("start"), 0);
        assert_eq!(g.boundary_events_of("b").len(), 1);
        assert!(g.boundary_events_of("a").is_empty());
        assert_eq!(g.none_start_events().len(), 1);
        assert!(g.timer_start_events().is_empty());
        assert!(g.flow_node("missing").is_err());
        assert!(g.schema().contains("b -> join(t5), ~b_timeout"));
    }

    #[test]
    fn test_reachability() {
        let g = graph(DIAMOND).unwrap();
        assert!(g.can_reach("a", "join"));
        assert!(g.can_reach("b", "late"));
        assert!(!g.can_reach("join", "a"));
        assert!(!g.can_reach("late", "join"));
    }

    #[test]
    fn test_validation() {
        let no_start = r#"{ "name": "x", "version": "1", "flow_nodes": [{ "id": "end", "type": "end_event" }] }"#;
        assert!(matches!(graph(no_start), Err(ProcflowError::Definition(_))));

        let dangling = r#"{ "name": "x", "version": "1",
            "flow_nodes": [{ "id": "start", "type": "start_event" }],
            "transitions": [{ "id": "t1", "source": "start", "target": "nowhere" }] }"#;
        assert!(graph(dangling).unwrap_err().to_string().contains("unknown target"));

        let bad_default = r#"{ "name": "x", "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "gw", "type": "exclusive_gateway", "default_transition": "t1" }
            ],
            "transitions": [{ "id": "t1", "source": "start", "target": "gw" }] }"#;
        assert!(graph(bad_default).is_err());

        let duplicate = r#"{ "name": "x", "version": "1",
            "flow_nodes": [{ "id": "start", "type": "start_event" }, { "id": "start", "type": "end_event" }] }"#;
        assert!(graph(duplicate).unwrap_err().to_string().contains("duplicate"));
    }
}
