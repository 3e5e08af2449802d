pub mod builder;
pub mod dag;
pub mod executor;
pub mod invoker;
pub mod node;
pub mod partial_data;
pub mod progress;

pub use builder::{
    broadcast_dag, broadcast_multi_dag, choice_dag, scatter_single_function_dag, sequence_dag,
    ChoiceBranchBuilder, DagBuilder, ParallelBranchBuilder,
};
pub use dag::Dag;
pub use executor::WorkflowExecutor;
pub use invoker::{FunctionInvoker, Invocation, InvocationRequest};
pub use node::{
    ChoiceNode, EndNode, FanInNode, FanOutKind, FanOutNode, MergeMode, Node, NodeKind, SimpleNode,
    StartNode, DEFAULT_FAN_IN_TIMEOUT_SECS,
};
pub use partial_data::{PartialData, PartialDataStore};
pub use progress::{NodeInfo, NodeStatus, Progress, ProgressStore};
