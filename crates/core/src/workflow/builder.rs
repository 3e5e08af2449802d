//! Fluent, branch-aware construction of [`Dag`]s.
//!
//! Structural mistakes do not abort construction: they are collected and
//! reported together by the terminal `build` call as
//! [`WorkflowError::Build`].

use super::dag::Dag;
use super::node::{
    ChoiceNode, FanInNode, FanOutKind, FanOutNode, MergeMode, Node, NodeKind, SimpleNode,
    DEFAULT_FAN_IN_TIMEOUT_SECS,
};
use crate::condition::Condition;
use crate::error::{Result, WorkflowError};
use crate::types::NodeId;
use std::time::Duration;

/// Builds a Dag one node at a time
pub struct DagBuilder {
    dag: Dag,
    prev: NodeId,
    branch_number: usize,
    errors: Vec<WorkflowError>,
}

impl DagBuilder {
    pub fn new() -> Self {
        let dag = Dag::new();
        let prev = dag.start.clone();
        Self {
            dag,
            prev,
            branch_number: 0,
            errors: Vec::new(),
        }
    }

    fn push_error(&mut self, err: WorkflowError) {
        tracing::debug!("Dag builder error: {}", err);
        self.errors.push(err);
    }

    /// Add `node` and chain it after the previous node.
    fn append(mut self, mut node: Node) -> Self {
        node.set_branch(self.branch_number);
        let id = node.id().clone();
        self.dag.add_node(node);
        match self.dag.chain(&self.prev, &id) {
            Ok(()) => self.prev = id,
            Err(e) => self.push_error(e),
        }
        self
    }

    /// Chain a node invoking `function`.
    pub fn add_simple_node(self, function: impl Into<String>) -> Self {
        self.add_simple_node_with_id(NodeId::generate(), function)
    }

    pub fn add_simple_node_with_id(self, id: impl Into<NodeId>, function: impl Into<String>) -> Self {
        self.append(Node::Simple(SimpleNode {
            id: id.into(),
            branch: 0,
            function: function.into(),
            next: None,
            max_response_time_ms: None,
        }))
    }

    /// Set the response-time budget of the most recently added Simple node.
    pub fn with_max_response_time(mut self, budget: Duration) -> Self {
        let prev = self.prev.clone();
        let Ok(millis) = u64::try_from(budget.as_millis()) else {
            self.push_error(WorkflowError::InvalidGraph(format!(
                "response-time budget of node {} does not fit in milliseconds",
                prev
            )));
            return self;
        };
        match self.dag.get_mut(&prev) {
            Ok(Node::Simple(simple)) => simple.max_response_time_ms = Some(millis),
            _ => self.push_error(WorkflowError::Unsupported(format!(
                "node {} has no response-time budget",
                prev
            ))),
        }
        self
    }

    /// Open an N-way branch. Each condition gets one alternative, supplied
    /// through the returned [`ChoiceBranchBuilder`] in condition order.
    pub fn add_choice_node(mut self, conditions: Vec<Condition>) -> ChoiceBranchBuilder {
        let declared = conditions.len();
        if declared == 0 {
            self.push_error(WorkflowError::InvalidGraph(
                "a choice node needs at least one condition".to_string(),
            ));
        }
        let choice = NodeId::generate();
        let builder = self.append(Node::Choice(ChoiceNode {
            id: choice.clone(),
            branch: 0,
            conditions,
            alternatives: Vec::new(),
        }));
        ChoiceBranchBuilder {
            builder,
            choice,
            declared,
            completed: 0,
        }
    }

    /// Like [`DagBuilder::add_choice_node`] with an always-true default
    /// condition appended as the last alternative.
    pub fn add_choice_node_with_default(self, mut conditions: Vec<Condition>) -> ChoiceBranchBuilder {
        conditions.push(Condition::constant(true));
        self.add_choice_node(conditions)
    }

    pub fn add_broadcast_fan_out_node(self, degree: usize) -> ParallelBranchBuilder {
        self.add_fan_out_node(FanOutKind::Broadcast, degree)
    }

    pub fn add_scatter_fan_out_node(self, degree: usize) -> ParallelBranchBuilder {
        self.add_fan_out_node(FanOutKind::Scatter, degree)
    }

    fn add_fan_out_node(mut self, kind: FanOutKind, degree: usize) -> ParallelBranchBuilder {
        if degree == 0 {
            self.push_error(WorkflowError::InvalidFanOutDegree(degree));
        }
        let fan_out = NodeId::generate();
        let builder = self.append(Node::FanOut(FanOutNode {
            id: fan_out.clone(),
            branch: 0,
            kind,
            degree,
            outputs: Vec::new(),
            associated_fan_in: None,
        }));
        ParallelBranchBuilder {
            builder,
            fan_out,
            declared: degree,
            completed: 0,
            terminals: Vec::new(),
        }
    }

    pub fn add_pass_node(self) -> Self {
        self.unsupported("pass")
    }

    pub fn add_wait_node(self) -> Self {
        self.unsupported("wait")
    }

    pub fn add_succeed_node(self) -> Self {
        self.unsupported("succeed")
    }

    pub fn add_fail_node(self) -> Self {
        self.unsupported("fail")
    }

    fn unsupported(mut self, kind: &str) -> Self {
        self.push_error(WorkflowError::Unsupported(format!(
            "{} nodes are not supported",
            kind
        )));
        self
    }

    /// Close the open branch to End and return the Dag.
    pub fn build(mut self) -> Result<Dag> {
        if self.prev != self.dag.end {
            let prev = self.prev.clone();
            if let Err(e) = self.dag.chain_to_end(&prev) {
                self.push_error(e);
            }
        }
        self.finish()
    }

    fn finish(self) -> Result<Dag> {
        if self.errors.is_empty() {
            Ok(self.dag)
        } else {
            Err(WorkflowError::Build(self.errors))
        }
    }

    /// Move the nodes of `sub` under `parent`. Returns the nodes that led
    /// to the End of `sub`; they still point at `sub.end`.
    fn splice(&mut self, parent: &NodeId, sub: Dag) -> Option<(Vec<NodeId>, NodeId)> {
        let first = match sub.start_next() {
            Some(first) if first != &sub.end => first.clone(),
            _ => {
                self.push_error(WorkflowError::InvalidGraph(format!(
                    "branch of {} is empty",
                    parent
                )));
                return None;
            }
        };

        self.branch_number += 1;
        let base = self.branch_number;
        let mut highest = base;
        let mut terminals = Vec::new();

        let Dag { end, nodes, .. } = sub;
        for (id, mut node) in nodes {
            if matches!(node.kind(), NodeKind::Start | NodeKind::End) {
                continue;
            }
            let branch = node.branch() + base;
            highest = highest.max(branch);
            node.set_branch(branch);
            if node.successors().contains(&end) {
                if node.kind() == NodeKind::FanOut {
                    self.push_error(WorkflowError::FanOutToEnd(id.clone()));
                }
                terminals.push(id.clone());
            }
            self.dag.add_node(node);
        }
        self.branch_number = highest;
        terminals.sort();

        if let Err(e) = self.dag.chain(parent, &first) {
            self.push_error(e);
        }
        Some((terminals, end))
    }

    fn redirect(&mut self, nodes: &[NodeId], old: &NodeId, new: &NodeId) {
        for id in nodes {
            match self.dag.get_mut(id) {
                Ok(node) => node.replace_successor(old, new),
                Err(e) => self.push_error(e),
            }
        }
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Supplies the alternatives of a Choice node, one branch at a time
pub struct ChoiceBranchBuilder {
    builder: DagBuilder,
    choice: NodeId,
    declared: usize,
    completed: usize,
}

impl ChoiceBranchBuilder {
    pub fn has_next_branch(&self) -> bool {
        self.completed < self.declared
    }

    /// Use `branch` as the next alternative. Its last nodes are re-chained
    /// to the End of the Dag under construction.
    pub fn next_branch(mut self, branch: Result<Dag>) -> Self {
        let sub = match branch {
            Ok(sub) => sub,
            Err(e) => {
                self.builder.push_error(e);
                self.completed += 1;
                return self;
            }
        };
        if !self.has_next_branch() {
            self.builder.push_error(WorkflowError::AlternativeMismatch {
                node: self.choice.clone(),
                conditions: self.declared,
                alternatives: self.completed + 1,
            });
            return self;
        }

        if let Some((terminals, old_end)) = self.builder.splice(&self.choice, sub) {
            let end = self.builder.dag.end.clone();
            self.builder.redirect(&terminals, &old_end, &end);
        }
        self.completed += 1;
        self
    }

    /// Send the next alternative straight to End.
    pub fn end_next_branch(mut self) -> Self {
        if !self.has_next_branch() {
            tracing::warn!("end_next_branch called on choice {} with no open branch", self.choice);
            return self;
        }
        self.builder.branch_number += 1;
        let choice = self.choice.clone();
        if let Err(e) = self.builder.dag.chain_to_end(&choice) {
            self.builder.push_error(e);
        }
        self.completed += 1;
        self
    }

    /// Fill every remaining alternative with a fresh Dag from `dagger`.
    pub fn for_each_branch<F>(mut self, dagger: F) -> Self
    where
        F: Fn() -> Result<Dag>,
    {
        while self.has_next_branch() {
            self = self.next_branch(dagger());
        }
        self
    }

    /// Close all open alternatives to End and return the Dag.
    pub fn end_choice_and_build(mut self) -> Result<Dag> {
        while self.has_next_branch() {
            self = self.end_next_branch();
        }
        self.build()
    }

    /// Return the Dag; every alternative must already be supplied.
    pub fn build(mut self) -> Result<Dag> {
        if self.has_next_branch() {
            let err = WorkflowError::UnclosedBranches {
                node: self.choice.clone(),
                open: self.declared - self.completed,
                declared: self.declared,
            };
            self.builder.push_error(err);
        }
        self.builder.prev = self.builder.dag.end.clone();
        self.builder.finish()
    }
}

/// Supplies the branches of a FanOut node until they converge on a FanIn
pub struct ParallelBranchBuilder {
    builder: DagBuilder,
    fan_out: NodeId,
    declared: usize,
    completed: usize,
    /// Last nodes of each branch with the End id they currently point to
    terminals: Vec<(Vec<NodeId>, NodeId)>,
}

impl ParallelBranchBuilder {
    pub fn has_next_branch(&self) -> bool {
        self.completed < self.declared
    }

    pub fn next_fan_out_branch(mut self, branch: Result<Dag>) -> Self {
        let sub = match branch {
            Ok(sub) => sub,
            Err(e) => {
                self.builder.push_error(e);
                self.completed += 1;
                return self;
            }
        };
        if !self.has_next_branch() {
            self.builder.push_error(WorkflowError::TooManyOutputs {
                node: self.fan_out.clone(),
                reason: format!("its fan-out degree is {}", self.declared),
            });
            return self;
        }

        if let Some(terminals) = self.builder.splice(&self.fan_out, sub) {
            self.terminals.push(terminals);
        }
        self.completed += 1;
        self
    }

    /// Fill every remaining branch with a fresh Dag from `dagger`.
    pub fn for_each_parallel_branch<F>(mut self, dagger: F) -> Self
    where
        F: Fn() -> Result<Dag>,
    {
        while self.has_next_branch() {
            self = self.next_fan_out_branch(dagger());
        }
        self
    }

    pub fn add_fan_in_node(self, mode: MergeMode) -> DagBuilder {
        self.add_fan_in_node_with_timeout(mode, Duration::from_secs(DEFAULT_FAN_IN_TIMEOUT_SECS))
    }

    /// Converge every branch on a new FanIn and continue linearly after it.
    pub fn add_fan_in_node_with_timeout(self, mode: MergeMode, timeout: Duration) -> DagBuilder {
        let Self {
            mut builder,
            fan_out,
            declared,
            completed,
            terminals,
        } = self;

        if completed < declared {
            builder.push_error(WorkflowError::UnclosedBranches {
                node: fan_out.clone(),
                open: declared - completed,
                declared,
            });
        }

        builder.branch_number += 1;
        let fan_in = NodeId::generate();
        builder.dag.add_node(Node::FanIn(FanInNode {
            id: fan_in.clone(),
            branch: builder.branch_number,
            degree: declared,
            mode,
            timeout_secs: timeout.as_secs(),
            next: None,
        }));

        for (nodes, old_end) in &terminals {
            builder.redirect(nodes, old_end, &fan_in);
        }
        match builder.dag.get_mut(&fan_out) {
            Ok(Node::FanOut(node)) => node.associated_fan_in = Some(fan_in.clone()),
            Ok(_) | Err(_) => builder.push_error(WorkflowError::NodeNotFound(fan_out.clone())),
        }

        builder.prev = fan_in;
        builder
    }
}

/// A Dag running `functions` one after another.
pub fn sequence_dag(functions: &[&str]) -> Result<Dag> {
    functions
        .iter()
        .fold(DagBuilder::new(), |builder, f| builder.add_simple_node(*f))
        .build()
}

/// A single Choice whose every alternative is a fresh Dag from `dagger`.
pub fn choice_dag<F>(dagger: F, conditions: Vec<Condition>) -> Result<Dag>
where
    F: Fn() -> Result<Dag>,
{
    DagBuilder::new()
        .add_choice_node(conditions)
        .for_each_branch(dagger)
        .end_choice_and_build()
}

/// Scatter the input across `degree` copies of `function`, collecting
/// the results into arrays.
pub fn scatter_single_function_dag(function: &str, degree: usize) -> Result<Dag> {
    DagBuilder::new()
        .add_scatter_fan_out_node(degree)
        .for_each_parallel_branch(|| sequence_dag(&[function]))
        .add_fan_in_node(MergeMode::AppendToArray)
        .build()
}

/// Broadcast the input to `degree` copies of the Dag made by `dagger`.
pub fn broadcast_dag<F>(dagger: F, degree: usize) -> Result<Dag>
where
    F: Fn() -> Result<Dag>,
{
    DagBuilder::new()
        .add_broadcast_fan_out_node(degree)
        .for_each_parallel_branch(dagger)
        .add_fan_in_node(MergeMode::NewMapEntry)
        .build()
}

/// Broadcast the input to one distinct Dag per branch.
pub fn broadcast_multi_dag(branches: Vec<Result<Dag>>) -> Result<Dag> {
    let builder = DagBuilder::new().add_broadcast_fan_out_node(branches.len());
    branches
        .into_iter()
        .fold(builder, |builder, branch| builder.next_fan_out_branch(branch))
        .add_fan_in_node(MergeMode::NewMapEntry)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn successors_of(dag: &Dag, id: &NodeId) -> Vec<NodeId> {
        dag.find(id).unwrap().successors()
    }

    /// Every node but End has a successor and exactly one node has none.
    fn assert_closed(dag: &Dag) {
        let sinks: Vec<&NodeId> = dag
            .nodes
            .values()
            .filter(|n| n.successors().is_empty())
            .map(|n| n.id())
            .collect();
        assert_eq!(sinks, vec![&dag.end]);
        dag.validate().unwrap();
    }

    #[test]
    fn test_sequence_dag() {
        let dag = sequence_dag(&["inc", "inc"]).unwrap();
        assert_eq!(dag.node_count(), 4);
        assert_closed(&dag);

        let first = dag.start_next().unwrap().clone();
        let second = successors_of(&dag, &first)[0].clone();
        assert_eq!(successors_of(&dag, &second), vec![dag.end.clone()]);
    }

    #[test]
    fn test_choice_branches_are_spliced_to_end() {
        let dag = DagBuilder::new()
            .add_choice_node(vec![
                Condition::constant(false),
                Condition::constant(false),
                Condition::constant(true),
            ])
            .next_branch(sequence_dag(&["a", "b"]))
            .next_branch(sequence_dag(&["c"]))
            .end_next_branch()
            .build()
            .unwrap();
        assert_closed(&dag);

        let choice = dag.start_next().unwrap().clone();
        let alternatives = successors_of(&dag, &choice);
        assert_eq!(alternatives.len(), 3);
        assert_eq!(alternatives[2], dag.end);

        let branches: Vec<usize> = alternatives[..2]
            .iter()
            .map(|id| dag.find(id).unwrap().branch())
            .collect();
        assert_eq!(branches, vec![1, 2]);
    }

    #[test]
    fn test_build_with_open_branches_fails() {
        let err = DagBuilder::new()
            .add_choice_node(vec![Condition::constant(true), Condition::constant(false)])
            .next_branch(sequence_dag(&["a"]))
            .build()
            .unwrap_err();

        match err {
            WorkflowError::Build(errors) => {
                assert!(matches!(errors[0], WorkflowError::UnclosedBranches { open: 1, .. }))
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_errors_accumulate() {
        let err = DagBuilder::new()
            .add_simple_node("a")
            .add_pass_node()
            .add_wait_node()
            .add_broadcast_fan_out_node(0)
            .add_fan_in_node(MergeMode::AddToSet)
            .build()
            .unwrap_err();

        match err {
            WorkflowError::Build(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(matches!(errors[2], WorkflowError::InvalidFanOutDegree(0)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_fan_out_to_end_rejected() {
        let mut dag = Dag::new();
        let fan_out = NodeId::new("fan_out");
        dag.add_node(Node::FanOut(FanOutNode {
            id: fan_out.clone(),
            branch: 0,
            kind: FanOutKind::Broadcast,
            degree: 1,
            outputs: Vec::new(),
            associated_fan_in: None,
        }));
        let err = dag.chain_to_end(&fan_out).unwrap_err();
        assert!(matches!(err, WorkflowError::FanOutToEnd(_)));

        let err = DagBuilder::new().add_broadcast_fan_out_node(2).builder.build().unwrap_err();
        assert!(err.to_string().contains("cannot be chained directly to the end node"));
    }

    #[test]
    fn test_parallel_branches_converge_on_fan_in() {
        let dag = broadcast_dag(|| sequence_dag(&["inc"]), 3).unwrap();
        assert_closed(&dag);
        assert_eq!(dag.width, 3);

        let fan_out = match dag.find(dag.start_next().unwrap()).unwrap() {
            Node::FanOut(node) => node.clone(),
            other => panic!("expected fan-out, got {:?}", other),
        };
        let fan_in_id = fan_out.associated_fan_in.clone().unwrap();
        let fan_in = match dag.find(&fan_in_id).unwrap() {
            Node::FanIn(node) => node.clone(),
            other => panic!("expected fan-in, got {:?}", other),
        };
        assert_eq!(fan_in.degree, fan_out.degree);
        assert_eq!(fan_in.next, Some(dag.end.clone()));
        for branch in &fan_out.outputs {
            assert_eq!(successors_of(&dag, branch), vec![fan_in_id.clone()]);
        }
        assert_eq!(dag.branch_index(&fan_out, &fan_out.outputs[2]), Some(2));
    }

    #[test]
    fn test_missing_parallel_branch_is_reported() {
        let err = DagBuilder::new()
            .add_broadcast_fan_out_node(2)
            .next_fan_out_branch(sequence_dag(&["a"]))
            .add_fan_in_node(MergeMode::NewMapEntry)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("1 of 2 branches"));
    }

    #[test]
    fn test_helpers_build_valid_dags() {
        let scatter = scatter_single_function_dag("square", 4).unwrap();
        assert_closed(&scatter);
        assert_eq!(scatter.unique_functions(), vec!["square".to_string()]);

        let multi =
            broadcast_multi_dag(vec![sequence_dag(&["a"]), sequence_dag(&["b", "c"])]).unwrap();
        assert_closed(&multi);
        assert_eq!(multi.unique_functions().len(), 3);

        let choice = choice_dag(
            || sequence_dag(&["x"]),
            vec![Condition::constant(false), Condition::constant(true)],
        )
        .unwrap();
        assert_closed(&choice);
    }

    #[test]
    fn test_nested_choice_inside_parallel_branch() {
        let dag = DagBuilder::new()
            .add_broadcast_fan_out_node(2)
            .next_fan_out_branch(choice_dag(
                || sequence_dag(&["a"]),
                vec![Condition::constant(true), Condition::constant(false)],
            ))
            .next_fan_out_branch(sequence_dag(&["b"]))
            .add_fan_in_node(MergeMode::NewMapEntry)
            .add_simple_node("after")
            .build()
            .unwrap();
        assert_closed(&dag);
    }

    #[test]
    fn test_response_time_budget() {
        let dag = DagBuilder::new()
            .add_simple_node_with_id("slow", "sleep")
            .with_max_response_time(Duration::from_millis(1500))
            .build()
            .unwrap();
        match dag.find(&NodeId::new("slow")).unwrap() {
            Node::Simple(node) => assert_eq!(node.max_response_time_ms, Some(1500)),
            other => panic!("expected simple node, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_response_time_budget_is_rejected() {
        let err = DagBuilder::new()
            .add_simple_node("sleep")
            .with_max_response_time(Duration::MAX)
            .build()
            .unwrap_err();

        assert!(err.is_structural());
        assert!(err.to_string().contains("does not fit in milliseconds"));
    }
}
