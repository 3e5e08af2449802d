use crate::error::Result;
use crate::signature::Signature;
use crate::types::{ExecutionReport, NodeId, Params, RequestId};
use async_trait::async_trait;
use std::time::Duration;

/// One function call issued by a Simple node
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub function: String,
    pub params: Params,
    pub max_response_time: Option<Duration>,
}

/// Output of a function call
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: Params,
    pub report: ExecutionReport,
}

/// Executes functions on behalf of Simple nodes.
///
/// Implementations must be safe to call concurrently and must release any
/// execution resource they acquired before returning.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation>;

    /// Declared signature of `function`, when known.
    fn signature(&self, _function: &str) -> Option<Signature> {
        None
    }

    /// Whether `function` can be invoked at all.
    fn knows(&self, _function: &str) -> bool {
        true
    }
}
