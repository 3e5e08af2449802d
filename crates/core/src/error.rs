use crate::types::{NodeId, RequestId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors raised while building, validating or executing a composition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    // Structural errors, detected while assembling a Dag.
    #[error("{open} of {declared} branches of node {node} are still open")]
    UnclosedBranches {
        node: NodeId,
        open: usize,
        declared: usize,
    },

    #[error("fan-out node {0} cannot be chained directly to the end node")]
    FanOutToEnd(NodeId),

    #[error("choice node {node} has {conditions} conditions but {alternatives} alternatives")]
    AlternativeMismatch {
        node: NodeId,
        conditions: usize,
        alternatives: usize,
    },

    #[error("node {node} cannot accept another successor: {reason}")]
    TooManyOutputs { node: NodeId, reason: String },

    #[error("invalid fan-out degree {0}: must be at least 1")]
    InvalidFanOutDegree(usize),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("dag construction failed with {} error(s): {}", .0.len(), join_errors(.0))]
    Build(Vec<WorkflowError>),

    // Evaluation errors, raised by the predicate evaluator.
    #[error("operator {op} expects {expected}, got {actual}")]
    Arity {
        op: String,
        expected: String,
        actual: usize,
    },

    #[error("invalid operand for {op}: {reason}")]
    InvalidOperand { op: String, reason: String },

    #[error("invalid match pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("no condition of choice node {0} matched the input")]
    NoChoiceMatched(NodeId),

    // Execution errors.
    #[error("invocation of function {function} failed: {reason}")]
    Invocation { function: String, reason: String },

    #[error("parallel wave failed: {}", describe_wave(.0))]
    ParallelWave(Vec<(NodeId, WorkflowError)>),

    #[error("fan-in node {node} received {received} of {expected} inputs")]
    FanInIncomplete {
        node: NodeId,
        received: usize,
        expected: usize,
    },

    #[error("fan-in node {0} timed out waiting for its branches")]
    FanInTimeout(NodeId),

    #[error("cannot scatter input of node {node}: {reason}")]
    Scatter { node: NodeId, reason: String },

    #[error("signature mismatch for {function}: {reason}")]
    SignatureMismatch { function: String, reason: String },

    // Lookup errors.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("no partial data for node {node} of request {request}")]
    PartialDataNotFound { request: RequestId, node: NodeId },

    #[error("composition {0} not found")]
    CompositionNotFound(String),

    #[error("function {0} not found")]
    FunctionNotFound(String),

    #[error("composition {0} already exists")]
    CompositionExists(String),

    // State errors.
    #[error("node {node} cannot move from {from} to {to}")]
    InvalidTransition {
        node: NodeId,
        from: String,
        to: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// True for lookups of unknown requests, nodes, compositions or functions.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ParallelWave(failures) => failures.iter().any(|(_, e)| e.is_not_found()),
            _ => matches!(
                self,
                Self::RequestNotFound(_)
                    | Self::NodeNotFound(_)
                    | Self::PartialDataNotFound { .. }
                    | Self::CompositionNotFound(_)
                    | Self::FunctionNotFound(_)
            ),
        }
    }

    /// True when the graph could not be built or is malformed.
    pub fn is_structural(&self) -> bool {
        match self {
            Self::ParallelWave(failures) => failures.iter().any(|(_, e)| e.is_structural()),
            _ => matches!(
                self,
                Self::UnclosedBranches { .. }
                    | Self::FanOutToEnd(_)
                    | Self::AlternativeMismatch { .. }
                    | Self::TooManyOutputs { .. }
                    | Self::InvalidFanOutDegree(_)
                    | Self::InvalidGraph(_)
                    | Self::Unsupported(_)
                    | Self::Build(_)
            ),
        }
    }

    /// True for predicate evaluation failures.
    pub fn is_evaluation(&self) -> bool {
        match self {
            Self::ParallelWave(failures) => failures.iter().any(|(_, e)| e.is_evaluation()),
            _ => matches!(
                self,
                Self::Arity { .. }
                    | Self::InvalidOperand { .. }
                    | Self::InvalidPattern { .. }
                    | Self::NoChoiceMatched(_)
            ),
        }
    }

    /// True when a function invocation could not be carried out, directly or
    /// as part of a parallel wave.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Invocation { .. } => true,
            Self::ParallelWave(failures) => failures.iter().any(|(_, e)| e.is_unavailable()),
            _ => false,
        }
    }
}

pub(crate) fn storage_err(err: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Storage(err.to_string())
}

fn join_errors(errors: &[WorkflowError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_wave(failures: &[(NodeId, WorkflowError)]) -> String {
    failures
        .iter()
        .map(|(node, err)| format!("{}: {}", node, err))
        .collect::<Vec<_>>()
        .join("; ")
}
