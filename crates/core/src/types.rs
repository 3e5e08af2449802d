use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for one invocation of a composition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a node of a Dag
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, used by the builder when the caller does not name a node.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Parameter mapping exchanged between nodes.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Execution report of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Output of the node, rendered as a string
    pub result: String,
    /// Wall-clock seconds from dispatch to output
    pub response_time: f64,
    pub is_warm_start: bool,
    /// Seconds spent initialising the execution environment
    pub init_time: f64,
    /// Seconds spent executing
    pub duration: f64,
}

impl ExecutionReport {
    /// Report for nodes that run in-process (Start, End, Choice, FanOut, FanIn).
    pub fn in_process(result: String, duration: f64) -> Self {
        Self {
            result,
            response_time: duration,
            is_warm_start: true,
            init_time: 0.0,
            duration,
        }
    }
}

/// Report returned by a whole-run invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionExecutionReport {
    /// Result mapping accumulated by the End node
    pub result: Params,
    /// Per-node reports keyed `"<kind>_<node id>"`
    pub reports: HashMap<String, ExecutionReport>,
    /// Seconds from request start to completion
    pub response_time: f64,
}
