use super::dag::Dag;
use super::node::NodeKind;
use crate::error::{Result, WorkflowError};
use crate::types::{NodeId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Execution status of a node within one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Executed,
    Skipped,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Ledger entry for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Wave index: nodes sharing a group may run concurrently
    pub group: usize,
    pub branch: usize,
}

/// Per-request execution state of a Dag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub request_id: RequestId,
    pub infos: Vec<NodeInfo>,
    /// Alternative taken by each evaluated Choice node
    #[serde(default)]
    pub choices: HashMap<NodeId, usize>,
    /// Time by which each FanIn must have all of its inputs
    #[serde(default)]
    pub fan_in_deadlines: HashMap<NodeId, DateTime<Utc>>,
}

impl Progress {
    /// Instantiate `dag` for one request.
    ///
    /// Each node's group is its longest distance from Start, so a FanIn
    /// waits for its slowest branch. End is placed one group after every
    /// other node.
    pub fn new(request_id: RequestId, dag: &Dag) -> Result<Self> {
        dag.get(&dag.start)?;
        let end = dag.get(&dag.end)?;

        let mut groups = HashMap::new();
        assign_groups(dag, &dag.start, 0, &mut groups);
        let last = groups.values().copied().max().unwrap_or(0);

        let mut infos: Vec<NodeInfo> = groups
            .into_iter()
            .filter_map(|(id, group)| {
                dag.find(&id).map(|node| NodeInfo {
                    id,
                    kind: node.kind(),
                    status: NodeStatus::Pending,
                    group,
                    branch: node.branch(),
                })
            })
            .collect();
        infos.push(NodeInfo {
            id: end.id().clone(),
            kind: NodeKind::End,
            status: NodeStatus::Pending,
            group: last + 1,
            branch: 0,
        });
        infos.sort_by(|a, b| (a.group, a.branch, &a.id).cmp(&(b.group, b.branch, &b.id)));

        Ok(Self {
            request_id,
            infos,
            choices: HashMap::new(),
            fan_in_deadlines: HashMap::new(),
        })
    }

    pub fn find(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.infos.iter().find(|info| &info.id == id)
    }

    pub fn status(&self, id: &NodeId) -> Result<NodeStatus> {
        self.find(id)
            .map(|info| info.status)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))
    }

    pub fn group_of(&self, id: &NodeId) -> Option<usize> {
        self.find(id).map(|info| info.group)
    }

    /// Lowest group that still has pending nodes.
    pub fn next_group(&self) -> Option<usize> {
        self.infos
            .iter()
            .filter(|info| info.status == NodeStatus::Pending)
            .map(|info| info.group)
            .min()
    }

    /// Pending nodes of the lowest pending group, in branch order.
    pub fn next_nodes(&self) -> Vec<NodeId> {
        match self.next_group() {
            Some(group) => self
                .infos
                .iter()
                .filter(|info| info.status == NodeStatus::Pending && info.group == group)
                .map(|info| info.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn transition(&mut self, id: &NodeId, to: NodeStatus) -> Result<()> {
        let info = self
            .infos
            .iter_mut()
            .find(|info| &info.id == id)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))?;
        if info.status.is_terminal() {
            return Err(WorkflowError::InvalidTransition {
                node: id.clone(),
                from: info.status.to_string(),
                to: to.to_string(),
            });
        }
        info.status = to;
        Ok(())
    }

    pub fn complete_node(&mut self, id: &NodeId) -> Result<()> {
        self.transition(id, NodeStatus::Executed)
    }

    pub fn skip_node(&mut self, id: &NodeId) -> Result<()> {
        self.transition(id, NodeStatus::Skipped)
    }

    /// Skip every pending node of `ids`; nodes already skipped are left alone.
    pub fn skip_all(&mut self, ids: &[NodeId]) -> Result<()> {
        for id in ids {
            if self.status(id)? != NodeStatus::Skipped {
                self.skip_node(id)?;
            }
        }
        Ok(())
    }

    pub fn fail_node(&mut self, id: &NodeId) -> Result<()> {
        self.transition(id, NodeStatus::Failed)
    }

    pub fn is_completed(&self) -> bool {
        self.infos
            .iter()
            .all(|info| info.status != NodeStatus::Pending)
    }

    pub fn record_choice(&mut self, choice: NodeId, taken: usize) {
        self.choices.insert(choice, taken);
    }

    /// Alternative taken by `choice`, or `None` before it is evaluated.
    pub fn first_match(&self, choice: &NodeId) -> Option<usize> {
        self.choices.get(choice).copied()
    }

    pub fn set_fan_in_deadline(&mut self, fan_in: NodeId, deadline: DateTime<Utc>) {
        self.fan_in_deadlines.insert(fan_in, deadline);
    }

    pub fn fan_in_deadline(&self, fan_in: &NodeId) -> Option<DateTime<Utc>> {
        self.fan_in_deadlines.get(fan_in).copied()
    }

    /// FanIn with the earliest deadline among those that have not run yet.
    pub fn earliest_open_deadline(&self) -> Option<(NodeId, DateTime<Utc>)> {
        self.fan_in_deadlines
            .iter()
            .filter(|(id, _)| matches!(self.status(id), Ok(NodeStatus::Pending)))
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(id, deadline)| (id.clone(), *deadline))
    }
}

fn assign_groups(dag: &Dag, id: &NodeId, group: usize, groups: &mut HashMap<NodeId, usize>) {
    if id == &dag.end {
        return;
    }
    if groups.get(id).is_some_and(|&existing| existing >= group) {
        return;
    }
    groups.insert(id.clone(), group);
    if let Some(node) = dag.find(id) {
        for next in node.successors() {
            assign_groups(dag, &next, group + 1, groups);
        }
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "progress of request {}:", self.request_id)?;
        for info in &self.infos {
            writeln!(
                f,
                "  [{}] {} {} (branch {}): {}",
                info.group, info.kind, info.id, info.branch, info.status
            )?;
        }
        Ok(())
    }
}

/// Process-wide Progress ledger, keyed by request
#[derive(Clone, Default)]
pub struct ProgressStore {
    progress: Arc<Mutex<HashMap<RequestId, Progress>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Progress>> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Instantiate `dag` for `request_id` and register the result.
    pub fn init(&self, request_id: RequestId, dag: &Dag) -> Result<Progress> {
        let progress = Progress::new(request_id.clone(), dag)?;
        self.lock().insert(request_id, progress.clone());
        Ok(progress)
    }

    pub fn get(&self, request_id: &RequestId) -> Result<Progress> {
        self.lock()
            .get(request_id)
            .cloned()
            .ok_or_else(|| WorkflowError::RequestNotFound(request_id.clone()))
    }

    pub fn save(&self, progress: Progress) {
        self.lock().insert(progress.request_id.clone(), progress);
    }

    pub fn next_nodes(&self, request_id: &RequestId) -> Result<Vec<NodeId>> {
        self.lock()
            .get(request_id)
            .map(Progress::next_nodes)
            .ok_or_else(|| WorkflowError::RequestNotFound(request_id.clone()))
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.lock().contains_key(request_id)
    }

    pub fn delete(&self, request_id: &RequestId) -> bool {
        self.lock().remove(request_id).is_some()
    }
}
