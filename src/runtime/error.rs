//! Error types for the flowl runtime.
//!
//! Domain errors use thiserror; `anyhow` appears only at binary boundaries.

use thiserror::Error;

use crate::driver::DriverError;
use crate::parser::ParseError;

/// Top-level runtime error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Parsing or validating the source failed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A driver operation failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// No flow is registered under the given id.
    #[error("flow {0:?} not found")]
    FlowNotFound(String),

    /// The flow is in the wrong status for the requested operation.
    #[error("flow {flow:?} is {status}, expected {expected}")]
    InvalidStatus {
        /// Flow id.
        flow: String,
        /// Current status name.
        status: String,
        /// Required status name.
        expected: String,
    },

    /// A `co` names a function no `load` registered.
    #[error("function {0:?} is not loaded")]
    FunctionNotLoaded(String),

    /// Two `load`s registered the same function name.
    #[error("function {0:?} loaded twice")]
    DuplicateFunction(String),

    /// A configured task node was placed into the queue twice.
    #[error("node {0:?} reused")]
    NodeReused(String),

    /// Internal sentinel: a task's gating condition evaluated to false.
    ///
    /// Converted to "not executed" by the result handler, never surfaced.
    #[error("condition evaluated to false")]
    ConditionFalse,

    /// The `exit` directive terminated the flow.
    #[error("exit: {0}")]
    Exit(String),

    /// A task of the step failed and the failure was not ignored.
    #[error("error at step {step}: {detail}")]
    StepFailed {
        /// 1-based step number.
        step: usize,
        /// First failing task's error.
        detail: String,
    },

    /// Execution was cancelled; wraps the cancellation cause.
    #[error("flow cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
