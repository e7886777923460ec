//! Parsing front end for the flowl language.
//!
//! Source text flows through a character-level lexer into per-line token
//! groups, then through a state-machine parser that builds a tree of blocks
//! with scoped variable tables. The run-queue compiler in [`crate::runtime`]
//! consumes the resulting [`Ast`].

/// Block tree, block bodies, and statements.
pub mod block;
/// Restricted arithmetic/comparison/logic evaluator.
pub mod expr;
/// Pattern tables and the parser state machine.
pub mod grammar;
/// Character-level lexer.
pub mod lexer;
/// Token kinds, validation, and `$(name)` segmentation.
pub mod token;
/// Scoped variables: lazy evaluation, caching, cycles, rewrites.
pub mod vars;

pub use block::{Ast, Block, BlockId, BlockKind, Body, Statement, StatementKind};
pub use expr::eval_expr;
pub use grammar::parse;
pub use lexer::{TokenLine, lex};
pub use token::{Seg, Token, TokenKind};
pub use vars::{VarNode, VarTable, RESERVED_CONDITION_VAR};

use thiserror::Error;

/// Convenience result alias for parser operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Errors surfaced while lexing, parsing, or validating a flowl source.
///
/// Every variant carries the source line where it was detected; parsing
/// aborts at the first failure.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Illegal character for the lexer's current state.
    #[error("line {line}: illegal character {ch:?} in {state} state")]
    Lex {
        /// Source line number (1-based).
        line: usize,
        /// Lexer state name at the point of failure.
        state: &'static str,
        /// The offending character.
        ch: char,
    },

    /// A token did not match the regular expression of its required kind.
    #[error("line {line}: token {text:?} does not match the {kind} pattern")]
    TokenPattern {
        /// Source line number.
        line: usize,
        /// Required token kind.
        kind: TokenKind,
        /// Offending token text.
        text: String,
    },

    /// A token had the wrong kind for its position in a statement pattern.
    #[error("line {line}: expected {expected}, got {got} {text:?} (rule {rule})")]
    TokenMismatch {
        /// Source line number.
        line: usize,
        /// Kind the pattern requires at this position.
        expected: TokenKind,
        /// Kind actually present.
        got: TokenKind,
        /// Offending token text.
        text: String,
        /// Short identifier of the violated grammar rule.
        rule: &'static str,
    },

    /// A reserved keyword appeared where a name is required.
    #[error("line {line}: keyword {text:?} cannot be used as {kind}")]
    KeywordAsName {
        /// Source line number.
        line: usize,
        /// Kind that was required.
        kind: TokenKind,
        /// The keyword text.
        text: String,
    },

    /// A statement does not fit any pattern of the current parser state.
    #[error("line {line}: {detail} (state {state})")]
    Statement {
        /// Source line number.
        line: usize,
        /// Parser state name.
        state: &'static str,
        /// Description of the shape violation.
        detail: String,
    },

    /// Duplicate `fn`, repeated `co` of the same fn, or equal targets.
    #[error("line {line}: identifier conflict: {detail}")]
    IdentConflict {
        /// Source line number.
        line: usize,
        /// Description of the conflict.
        detail: String,
    },

    /// A `$(name)` reference did not resolve in any enclosing scope.
    #[error("line {line}: undefined variable {name:?}")]
    UndefinedVariable {
        /// Source line number.
        line: usize,
        /// The unresolved name.
        name: String,
    },

    /// Two variable definitions with the same name in one block.
    #[error("line {line}: duplicate variable {name:?} in the same block")]
    DuplicateVariable {
        /// Source line number.
        line: usize,
        /// The redefined name.
        name: String,
    },

    /// The variable graph contains a reference cycle.
    #[error("variable cycle detected at {name:?}")]
    VariableCycle {
        /// A variable on the cycle.
        name: String,
    },

    /// A reference like `$(a.b.c)` with more than one field segment.
    #[error("malformed variable reference {text:?}: at most one field segment is allowed")]
    MalformedFieldPath {
        /// The offending reference text.
        text: String,
    },

    /// Expression evaluation failed.
    #[error("expression error: {0}")]
    Expr(String),

    /// Block terminators were not balanced at end of input.
    #[error("unbalanced terminators: parser ended in {state} state")]
    Unbalanced {
        /// Final parser state name.
        state: &'static str,
    },
}
