use super::node::{EndNode, FanOutNode, Node, NodeKind, StartNode};
use crate::error::{Result, WorkflowError};
use crate::types::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Compiled function composition: nodes keyed by id plus the designated
/// Start and End nodes. `width` is the largest fan-out degree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub start: NodeId,
    pub end: NodeId,
    pub nodes: HashMap<NodeId, Node>,
    pub width: usize,
}

impl Dag {
    /// A Dag holding only an unchained Start and an End.
    pub fn new() -> Self {
        let start = NodeId::generate();
        let end = NodeId::generate();
        let mut nodes = HashMap::new();
        nodes.insert(
            start.clone(),
            Node::Start(StartNode {
                id: start.clone(),
                next: None,
            }),
        );
        nodes.insert(end.clone(), Node::End(EndNode { id: end.clone() }));

        Self {
            start,
            end,
            nodes,
            width: 1,
        }
    }

    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Like [`Dag::find`] but unknown ids are an error.
    pub fn get(&self, id: &NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))
    }

    pub fn add_node(&mut self, node: Node) {
        self.width = self.width.max(node.width());
        self.nodes.insert(node.id().clone(), node);
    }

    /// Add the edge `from -> to`. A FanOut may never lead straight to End.
    pub fn chain(&mut self, from: &NodeId, to: &NodeId) -> Result<()> {
        if !self.nodes.contains_key(to) {
            return Err(WorkflowError::NodeNotFound(to.clone()));
        }
        let end = self.end.clone();
        let node = self.get_mut(from)?;
        if to == &end && node.kind() == NodeKind::FanOut {
            return Err(WorkflowError::FanOutToEnd(from.clone()));
        }
        node.add_output(to.clone())
    }

    pub fn chain_to_end(&mut self, from: &NodeId) -> Result<()> {
        let end = self.end.clone();
        self.chain(from, &end)
    }

    /// The single successor of Start, if chained.
    pub fn start_next(&self) -> Option<&NodeId> {
        match self.nodes.get(&self.start) {
            Some(Node::Start(start)) => start.next.as_ref(),
            _ => None,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Distinct function names invoked by the Dag, sorted.
    pub fn unique_functions(&self) -> Vec<String> {
        let mut functions: Vec<String> = self
            .nodes
            .values()
            .filter_map(|node| match node {
                Node::Simple(simple) => Some(simple.function.clone()),
                _ => None,
            })
            .collect();
        functions.sort();
        functions.dedup();
        functions
    }

    /// Ids of `from` and everything downstream of it.
    pub fn reachable_from(&self, from: &NodeId) -> HashSet<NodeId> {
        self.reachable_with(from, |_, node| node.successors())
    }

    fn reachable_with<F>(&self, from: &NodeId, successors: F) -> HashSet<NodeId>
    where
        F: Fn(&NodeId, &Node) -> Vec<NodeId>,
    {
        let mut seen = HashSet::new();
        let mut stack = vec![from.clone()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(successors(&id, node));
            }
        }
        seen
    }

    /// Nodes that become dead once `choice` has taken alternative `taken`:
    /// reachable from a non-taken alternative and no longer reachable from
    /// Start. Shared convergence points stay live. Sorted for determinism.
    pub fn nodes_to_skip(&self, choice: &NodeId, taken: usize) -> Result<Vec<NodeId>> {
        let alternatives = match self.get(choice)? {
            Node::Choice(node) => node.alternatives.clone(),
            other => {
                return Err(WorkflowError::InvalidGraph(format!(
                    "node {} is a {} node, not a choice",
                    choice,
                    other.kind()
                )))
            }
        };
        if taken >= alternatives.len() {
            return Err(WorkflowError::InvalidGraph(format!(
                "choice {} has no alternative {}",
                choice, taken
            )));
        }

        let live = self.reachable_with(&self.start, |id, node| match node {
            Node::Choice(_) if id == choice => vec![alternatives[taken].clone()],
            _ => node.successors(),
        });

        let mut skip: Vec<NodeId> = alternatives
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != taken)
            .flat_map(|(_, alternative)| self.reachable_from(alternative))
            .filter(|id| !live.contains(id) && id != &self.end)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        skip.sort();
        Ok(skip)
    }

    /// The FanOut whose branches converge on `fan_in`.
    pub fn fan_out_of(&self, fan_in: &NodeId) -> Option<&FanOutNode> {
        self.nodes.values().find_map(|node| match node {
            Node::FanOut(fan_out) if fan_out.associated_fan_in.as_ref() == Some(fan_in) => {
                Some(fan_out)
            }
            _ => None,
        })
    }

    /// Position of the FanOut branch that contains `node`.
    pub fn branch_index(&self, fan_out: &FanOutNode, node: &NodeId) -> Option<usize> {
        fan_out
            .outputs
            .iter()
            .position(|first| first == node || self.reachable_from(first).contains(node))
    }

    pub fn predecessors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut preds: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.successors().contains(id))
            .map(|node| node.id().clone())
            .collect();
        preds.sort();
        preds
    }

    fn to_graph(&self) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for id in self.nodes.keys() {
            indices.insert(id.clone(), graph.add_node(id.clone()));
        }
        for (id, node) in &self.nodes {
            for next in node.successors() {
                if let (Some(&from), Some(&to)) = (indices.get(id), indices.get(&next)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        (graph, indices)
    }

    /// Check the structural invariants of an externally supplied Dag.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        match self.nodes.get(&self.start) {
            Some(Node::Start(start)) if start.next.is_none() => {
                problems.push("start node has no successor".to_string())
            }
            Some(Node::Start(_)) => {}
            _ => problems.push(format!("start node {} is missing", self.start)),
        }
        if !matches!(self.nodes.get(&self.end), Some(Node::End(_))) {
            problems.push(format!("end node {} is missing", self.end));
        }

        for (id, node) in &self.nodes {
            if node.id() != id {
                problems.push(format!("node {} is stored under key {}", node.id(), id));
            }
            if matches!(node, Node::Start(_)) && id != &self.start {
                problems.push(format!("extra start node {}", id));
            }
            if matches!(node, Node::End(_)) && id != &self.end {
                problems.push(format!("extra end node {}", id));
            }
            for next in node.successors() {
                if !self.nodes.contains_key(&next) {
                    problems.push(format!("node {} points to unknown node {}", id, next));
                }
            }
            if id != &self.end && node.successors().is_empty() {
                problems.push(format!("node {} has no successor", id));
            }
            match node {
                Node::Choice(choice) if choice.alternatives.len() != choice.conditions.len() => {
                    problems.push(
                        WorkflowError::AlternativeMismatch {
                            node: id.clone(),
                            conditions: choice.conditions.len(),
                            alternatives: choice.alternatives.len(),
                        }
                        .to_string(),
                    )
                }
                Node::FanOut(fan_out) => {
                    if fan_out.degree == 0 || fan_out.outputs.len() != fan_out.degree {
                        problems.push(format!(
                            "fan-out {} has degree {} but {} branches",
                            id,
                            fan_out.degree,
                            fan_out.outputs.len()
                        ));
                    }
                    if fan_out.outputs.contains(&self.end) {
                        problems.push(WorkflowError::FanOutToEnd(id.clone()).to_string());
                    }
                    if let Some(Node::FanIn(fan_in)) =
                        fan_out.associated_fan_in.as_ref().and_then(|f| self.nodes.get(f))
                    {
                        if fan_in.degree != fan_out.degree {
                            problems.push(format!(
                                "fan-in {} has degree {} but its fan-out {} has degree {}",
                                fan_in.id, fan_in.degree, id, fan_out.degree
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        if !problems.is_empty() {
            return Err(WorkflowError::InvalidGraph(problems.join("; ")));
        }

        let (graph, indices) = self.to_graph();
        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(WorkflowError::InvalidGraph(
                "composition contains a cycle".to_string(),
            ));
        }

        let reachable = self.reachable_from(&self.start);
        let end = indices[&self.end];
        let mut ids: Vec<&NodeId> = self.nodes.keys().collect();
        ids.sort();
        for id in ids {
            if !reachable.contains(id) {
                problems.push(format!("node {} is not reachable from start", id));
            }
            if !petgraph::algo::has_path_connecting(&graph, indices[id], end, None) {
                problems.push(format!("node {} never reaches the end node", id));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::InvalidGraph(problems.join("; ")))
        }
    }
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::workflow::builder::{sequence_dag, DagBuilder};
    use crate::workflow::node::SimpleNode;

    #[test]
    fn test_new_dag_has_start_and_end() {
        let dag = Dag::new();
        assert_eq!(dag.node_count(), 2);
        assert!(dag.start_next().is_none());
        assert!(matches!(dag.find(&dag.end), Some(Node::End(_))));
    }

    #[test]
    fn test_sequence_validates() {
        let dag = sequence_dag(&["a", "b", "a"]).unwrap();
        dag.validate().unwrap();
        assert_eq!(dag.unique_functions(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(dag.predecessors(&dag.end).len(), 1);
    }

    #[test]
    fn test_unchained_node_fails_validation() {
        let mut dag = sequence_dag(&["a"]).unwrap();
        dag.add_node(Node::Simple(SimpleNode {
            id: NodeId::new("orphan"),
            branch: 0,
            function: "b".to_string(),
            next: None,
            max_response_time_ms: None,
        }));

        let err = dag.validate().unwrap_err();
        assert!(err.to_string().contains("orphan has no successor"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut dag = Dag::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        for id in [&a, &b] {
            dag.add_node(Node::Simple(SimpleNode {
                id: id.clone(),
                branch: 0,
                function: "f".to_string(),
                next: None,
                max_response_time_ms: None,
            }));
        }
        let start = dag.start.clone();
        dag.chain(&start, &a).unwrap();
        dag.chain(&a, &b).unwrap();
        dag.chain(&b, &a).unwrap();

        let err = dag.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_nodes_to_skip_keeps_shared_nodes() {
        // choice -> [a -> shared, b -> shared], shared -> end
        let mut dag = Dag::new();
        let shared = NodeId::new("shared");
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let choice = NodeId::new("choice");
        dag.add_node(Node::Choice(crate::workflow::node::ChoiceNode {
            id: choice.clone(),
            branch: 0,
            conditions: vec![Condition::constant(true), Condition::constant(true)],
            alternatives: Vec::new(),
        }));
        for id in [&a, &b, &shared] {
            dag.add_node(Node::Simple(SimpleNode {
                id: id.clone(),
                branch: 0,
                function: "f".to_string(),
                next: None,
                max_response_time_ms: None,
            }));
        }
        let start = dag.start.clone();
        dag.chain(&start, &choice).unwrap();
        dag.chain(&choice, &a).unwrap();
        dag.chain(&choice, &b).unwrap();
        dag.chain(&a, &shared).unwrap();
        dag.chain(&b, &shared).unwrap();
        dag.chain_to_end(&shared).unwrap();
        dag.validate().unwrap();

        assert_eq!(dag.nodes_to_skip(&choice, 0).unwrap(), vec![b.clone()]);
        assert_eq!(dag.nodes_to_skip(&choice, 1).unwrap(), vec![a.clone()]);
    }

    #[test]
    fn test_dag_json_roundtrip_keeps_structure() {
        let dag = DagBuilder::new()
            .add_simple_node("inc")
            .add_choice_node(vec![Condition::constant(false), Condition::constant(true)])
            .next_branch(sequence_dag(&["double"]))
            .end_next_branch()
            .end_choice_and_build()
            .unwrap();

        let json = serde_json::to_string(&dag).unwrap();
        let back: Dag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dag);
        back.validate().unwrap();
    }
}
