//! Block tree for parsed flowl programs.
//!
//! Blocks live in an arena owned by [`Ast`]; parent links are plain indices,
//! so the back edge carries no ownership. Each block has a four-token header
//! (`kind`, `target1`, `operator`, `target2`), an optional body in one of
//! three shapes, an ordered list of child blocks, and a private variable
//! table.

use std::sync::Arc;

use super::token::Token;
use super::vars::{VarNode, VarTable};
use super::{ParseError, Result};

/// Index of a block inside the [`Ast`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// Classified block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// The implicit file-scope block.
    Global,
    /// `load "driver:path[@version]"`.
    Load,
    /// `fn NAME = FUNC { … }`.
    Fn,
    /// `args = { … }` inside a fn.
    Args,
    /// One function invocation (any of the four `co` forms).
    Co,
    /// `for [cond] { … }`.
    For,
    /// `if cond { … }`.
    If,
    /// `switch { … }`.
    Switch,
    /// `case cond { … }`.
    Case,
    /// `default { … }`.
    Default,
    /// `event { co+ }`.
    Event,
    /// A built-in directive statement (`sleep`, `println`, …).
    Directive,
}

/// Descriptor of a statement inside a plain body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// `var NAME [= expr]`.
    Var,
    /// `NAME <- expr`.
    RewriteVar,
    /// `"key" : "value"` map entry.
    Kv,
    /// Bare element of a list body.
    Element,
}

/// An ordered token sequence with a descriptor.
#[derive(Debug, Clone)]
pub struct Statement {
    /// What the statement is.
    pub kind: StatementKind,
    /// The statement's tokens in source order.
    pub tokens: Vec<Token>,
}

impl Statement {
    /// Construct a statement.
    pub fn new(kind: StatementKind, tokens: Vec<Token>) -> Self {
        Self { kind, tokens }
    }
}

/// Block body, present only where the grammar allows one.
#[derive(Debug, Clone)]
pub enum Body {
    /// Ordered statements (`var`, rewrite).
    Plain(Vec<Statement>),
    /// Ordered `key : value` pairs.
    Map(Vec<(Token, Token)>),
    /// Element-only list.
    List(Vec<Token>),
}

impl Body {
    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Body::Plain(stmts) => stmts.len(),
            Body::Map(pairs) => pairs.len(),
            Body::List(items) => items.len(),
        }
    }

    /// Whether the body has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statements of a plain body.
    pub fn statements(&self) -> &[Statement] {
        match self {
            Body::Plain(stmts) => stmts,
            _ => &[],
        }
    }

    /// Pairs of a map body.
    pub fn pairs(&self) -> &[(Token, Token)] {
        match self {
            Body::Map(pairs) => pairs,
            _ => &[],
        }
    }

    /// Elements of a list body.
    pub fn elements(&self) -> &[Token] {
        match self {
            Body::List(items) => items,
            _ => &[],
        }
    }
}

/// One block of the tree.
#[derive(Debug)]
pub struct Block {
    /// Classified kind.
    pub kind: BlockKind,
    /// First header slot (name, location, or directive argument owner).
    pub target1: Token,
    /// Operator header slot (`=`, `->`, or empty).
    pub operator: Token,
    /// Second header slot.
    pub target2: Token,
    /// Parent block, `None` only for the global block.
    pub parent: Option<BlockId>,
    /// Child blocks in source order.
    pub children: Vec<BlockId>,
    /// Body, when the grammar allows one.
    pub body: Option<Body>,
    /// Variables introduced in this block.
    pub vars: VarTable,
    /// Source line of the header.
    pub line: usize,
}

impl Block {
    /// A block with an empty header.
    pub fn new(kind: BlockKind, parent: Option<BlockId>, line: usize) -> Self {
        Self {
            kind,
            target1: Token::empty(),
            operator: Token::empty(),
            target2: Token::empty(),
            parent,
            children: Vec::new(),
            body: None,
            vars: VarTable::new(),
            line,
        }
    }

    /// `target1` and `target2` may not carry the same non-empty string.
    pub fn check_targets(&self) -> Result<()> {
        if !self.target1.is_empty() && self.target1.text == self.target2.text {
            return Err(ParseError::IdentConflict {
                line: self.line,
                detail: format!(
                    "target1 and target2 are both {:?}",
                    self.target1.text
                ),
            });
        }
        Ok(())
    }
}

/// Arena-backed AST.
#[derive(Debug)]
pub struct Ast {
    blocks: Vec<Block>,
    /// Flow description captured from the file's leading comment.
    pub desc: String,
}

impl Ast {
    /// An AST holding only the global block.
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::new(BlockKind::Global, None, 0)],
            desc: String::new(),
        }
    }

    /// Id of the global block.
    pub fn global(&self) -> BlockId {
        BlockId(0)
    }

    /// Append `block` as the last child of `parent`.
    pub fn push_block(&mut self, parent: BlockId, mut block: Block) -> BlockId {
        block.parent = Some(parent);
        let id = BlockId(self.blocks.len());
        self.blocks.push(block);
        self.blocks[parent.0].children.push(id);
        id
    }

    /// Borrow a block.
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    /// Mutably borrow a block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    /// Number of blocks including the global one.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether only the global block exists.
    pub fn is_empty(&self) -> bool {
        self.blocks.len() <= 1
    }

    /// Ids of all blocks in creation (source) order.
    pub fn ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId)
    }

    /// Walk `block → parent* → global` for the first table holding `name`.
    pub fn lookup_var(&self, block: BlockId, name: &str) -> Option<Arc<VarNode>> {
        let mut cursor = Some(block);
        while let Some(id) = cursor {
            let b = self.block(id);
            if let Some(node) = b.vars.get(name) {
                return Some(node);
            }
            cursor = b.parent;
        }
        None
    }

    /// Every variable node of every block.
    pub fn all_var_nodes(&self) -> Vec<Arc<VarNode>> {
        self.blocks.iter().flat_map(|b| b.vars.nodes()).collect()
    }

    /// Condition variables of every enclosing `if`/`case`/`default` block,
    /// innermost first.
    pub fn enclosing_conditions(&self, block: BlockId) -> Vec<(BlockId, Arc<VarNode>)> {
        use super::vars::RESERVED_CONDITION_VAR;
        let mut out = Vec::new();
        let mut cursor = Some(block);
        while let Some(id) = cursor {
            let b = self.block(id);
            if matches!(b.kind, BlockKind::If | BlockKind::Case | BlockKind::Default) {
                if let Some(cond) = b.vars.get(RESERVED_CONDITION_VAR) {
                    out.push((id, cond));
                }
            }
            cursor = b.parent;
        }
        out
    }
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}
