//! flowl – a concurrent workflow engine for a small function-composition DSL.
//!
//! A flowl source file loads named functions from pluggable drivers,
//! optionally configures them with argument bundles, and composes their
//! invocations sequentially, in parallel groups, inside loops, and under
//! conditional branches. This crate implements:
//! - Lexer and parser producing a block tree with scoped variable tables
//! - Lazy variable evaluation with caching, rewrites, and cycle detection
//! - A run-queue compiler lowering the tree into a linear node sequence
//! - A scheduler driving the queue with concurrent workers, step barriers,
//!   retry/ignore policy, cancellation, and event-driven re-execution
//! - Read-only insight snapshots for polling UIs

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Function driver layer: capability trait, registry, built-in kinds.
pub mod driver;
/// Lexing, parsing, and the variable system.
pub mod parser;
/// Run-queue compilation, flow state, and the scheduler.
pub mod runtime;

// Re-export key types for convenience
pub use parser::{Ast, ParseError, parse};
pub use runtime::{
    FlowId, FlowRunningInsight, FlowStatus, LogBucket, RunQueue, RuntimeError, Scheduler,
};

/// Current version of the flowl engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
