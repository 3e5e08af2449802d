// Core engine for Waveflow function compositions

pub mod composition;
pub mod condition;
pub mod error;
pub mod signature;
pub mod storage;
pub mod types;
pub mod workflow;

pub use composition::{CompositionRegistry, FunctionComposition};
pub use condition::{CondOp, Condition, Operand};
pub use error::{Result, WorkflowError};
pub use signature::{DataType, ParamDef, Signature};
pub use types::*;
