use crate::condition::Condition;
use crate::error::{Result, WorkflowError};
use crate::types::{NodeId, Params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default time a FanIn waits for its branches, in seconds
pub const DEFAULT_FAN_IN_TIMEOUT_SECS: u64 = 60;

/// Node-type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Simple,
    Choice,
    FanOut,
    FanIn,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Simple => "simple",
            Self::Choice => "choice",
            Self::FanOut => "fan_out",
            Self::FanIn => "fan_in",
        };
        f.write_str(name)
    }
}

/// A unit of work in a Dag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum Node {
    Start(StartNode),
    End(EndNode),
    Simple(SimpleNode),
    Choice(ChoiceNode),
    FanOut(FanOutNode),
    FanIn(FanInNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartNode {
    pub id: NodeId,
    #[serde(default)]
    pub next: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndNode {
    pub id: NodeId,
}

/// Invokes one function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleNode {
    pub id: NodeId,
    #[serde(default)]
    pub branch: usize,
    pub function: String,
    #[serde(default)]
    pub next: Option<NodeId>,
    /// Response-time budget handed to the invoker, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_time_ms: Option<u64>,
}

/// N-way branch: the first condition that holds selects the alternative
/// with the same index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceNode {
    pub id: NodeId,
    #[serde(default)]
    pub branch: usize,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub alternatives: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutKind {
    /// Every branch receives a copy of the input
    Broadcast,
    /// An array entry of the input is partitioned across the branches
    Scatter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutNode {
    pub id: NodeId,
    #[serde(default)]
    pub branch: usize,
    pub kind: FanOutKind,
    pub degree: usize,
    #[serde(default)]
    pub outputs: Vec<NodeId>,
    #[serde(default)]
    pub associated_fan_in: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// `{"0": <branch 0 output>, "1": <branch 1 output>, ...}`
    NewMapEntry,
    /// One array per key, values in branch order
    AppendToArray,
    /// Like `AppendToArray` without duplicates
    AddToSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInNode {
    pub id: NodeId,
    #[serde(default)]
    pub branch: usize,
    pub degree: usize,
    pub mode: MergeMode,
    #[serde(default = "default_fan_in_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub next: Option<NodeId>,
}

fn default_fan_in_timeout() -> u64 {
    DEFAULT_FAN_IN_TIMEOUT_SECS
}

impl Node {
    pub fn id(&self) -> &NodeId {
        match self {
            Self::Start(n) => &n.id,
            Self::End(n) => &n.id,
            Self::Simple(n) => &n.id,
            Self::Choice(n) => &n.id,
            Self::FanOut(n) => &n.id,
            Self::FanIn(n) => &n.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Start(_) => NodeKind::Start,
            Self::End(_) => NodeKind::End,
            Self::Simple(_) => NodeKind::Simple,
            Self::Choice(_) => NodeKind::Choice,
            Self::FanOut(_) => NodeKind::FanOut,
            Self::FanIn(_) => NodeKind::FanIn,
        }
    }

    /// Branch number assigned by the builder; Start and End sit on branch 0.
    pub fn branch(&self) -> usize {
        match self {
            Self::Start(_) | Self::End(_) => 0,
            Self::Simple(n) => n.branch,
            Self::Choice(n) => n.branch,
            Self::FanOut(n) => n.branch,
            Self::FanIn(n) => n.branch,
        }
    }

    pub fn set_branch(&mut self, branch: usize) {
        match self {
            Self::Start(_) | Self::End(_) => {}
            Self::Simple(n) => n.branch = branch,
            Self::Choice(n) => n.branch = branch,
            Self::FanOut(n) => n.branch = branch,
            Self::FanIn(n) => n.branch = branch,
        }
    }

    /// All structural successors. For a Choice this is every alternative.
    pub fn successors(&self) -> Vec<NodeId> {
        match self {
            Self::Start(n) => n.next.iter().cloned().collect(),
            Self::End(_) => Vec::new(),
            Self::Simple(n) => n.next.iter().cloned().collect(),
            Self::Choice(n) => n.alternatives.clone(),
            Self::FanOut(n) => n.outputs.clone(),
            Self::FanIn(n) => n.next.iter().cloned().collect(),
        }
    }

    /// Number of parallel branches opened by this node.
    pub fn width(&self) -> usize {
        match self {
            Self::FanOut(n) => n.degree,
            _ => 1,
        }
    }

    /// Chain `next` after this node.
    pub fn add_output(&mut self, next: NodeId) -> Result<()> {
        match self {
            Self::Start(StartNode { id, next: slot })
            | Self::Simple(SimpleNode { id, next: slot, .. })
            | Self::FanIn(FanInNode { id, next: slot, .. }) => {
                if slot.is_some() {
                    return Err(WorkflowError::TooManyOutputs {
                        node: id.clone(),
                        reason: "it already has a successor".to_string(),
                    });
                }
                *slot = Some(next);
                Ok(())
            }
            Self::Choice(n) => {
                if n.alternatives.len() >= n.conditions.len() {
                    return Err(WorkflowError::AlternativeMismatch {
                        node: n.id.clone(),
                        conditions: n.conditions.len(),
                        alternatives: n.alternatives.len() + 1,
                    });
                }
                n.alternatives.push(next);
                Ok(())
            }
            Self::FanOut(n) => {
                if n.outputs.len() >= n.degree {
                    return Err(WorkflowError::TooManyOutputs {
                        node: n.id.clone(),
                        reason: format!("its fan-out degree is {}", n.degree),
                    });
                }
                n.outputs.push(next);
                Ok(())
            }
            Self::End(n) => Err(WorkflowError::TooManyOutputs {
                node: n.id.clone(),
                reason: "the end node has no successors".to_string(),
            }),
        }
    }

    /// Point every edge to `old` at `new` instead.
    pub fn replace_successor(&mut self, old: &NodeId, new: &NodeId) {
        let swap = |slot: &mut NodeId| {
            if slot == old {
                *slot = new.clone();
            }
        };
        match self {
            Self::Start(StartNode { next, .. })
            | Self::Simple(SimpleNode { next, .. })
            | Self::FanIn(FanInNode { next, .. }) => {
                if let Some(slot) = next.as_mut() {
                    swap(slot);
                }
            }
            Self::Choice(n) => n.alternatives.iter_mut().for_each(swap),
            Self::FanOut(n) => n.outputs.iter_mut().for_each(swap),
            Self::End(_) => {}
        }
    }
}

impl ChoiceNode {
    /// Index of the first condition that holds for `input`.
    pub fn evaluate(&self, input: &Params) -> Result<usize> {
        for (index, condition) in self.conditions.iter().enumerate() {
            if condition.test(input)? {
                return Ok(index);
            }
        }
        Err(WorkflowError::NoChoiceMatched(self.id.clone()))
    }
}

impl FanOutNode {
    /// Split `input` into one mapping per branch, in branch order.
    pub fn split(&self, input: &Params) -> Result<Vec<Params>> {
        match self.kind {
            FanOutKind::Broadcast => Ok(vec![input.clone(); self.degree]),
            FanOutKind::Scatter => {
                let (name, items) = input
                    .iter()
                    .find_map(|(k, v)| v.as_array().map(|items| (k, items)))
                    .ok_or_else(|| WorkflowError::Scatter {
                        node: self.id.clone(),
                        reason: format!("expected an array entry with {} elements", self.degree),
                    })?;
                if items.len() != self.degree {
                    return Err(WorkflowError::Scatter {
                        node: self.id.clone(),
                        reason: format!(
                            "array '{}' has {} elements but the fan-out degree is {}",
                            name,
                            items.len(),
                            self.degree
                        ),
                    });
                }
                Ok(items
                    .iter()
                    .map(|item| {
                        let mut part = Params::new();
                        part.insert(name.clone(), item.clone());
                        part
                    })
                    .collect())
            }
        }
    }
}

impl FanInNode {
    /// Merge branch outputs, given in branch order.
    pub fn merge(&self, inputs: Vec<Params>) -> Result<Params> {
        if inputs.len() != self.degree {
            return Err(WorkflowError::FanInIncomplete {
                node: self.id.clone(),
                received: inputs.len(),
                expected: self.degree,
            });
        }

        let mut merged = Params::new();
        match self.mode {
            MergeMode::NewMapEntry => {
                for (index, input) in inputs.into_iter().enumerate() {
                    merged.insert(index.to_string(), Value::Object(input));
                }
            }
            MergeMode::AppendToArray | MergeMode::AddToSet => {
                let dedup = self.mode == MergeMode::AddToSet;
                for input in inputs {
                    for (key, value) in input {
                        let entry = merged
                            .entry(key)
                            .or_insert_with(|| Value::Array(Vec::new()));
                        if let Value::Array(values) = entry {
                            if !(dedup && values.contains(&value)) {
                                values.push(value);
                            }
                        }
                    }
                }
            }
        }
        Ok(merged)
    }
}
