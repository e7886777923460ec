//! Scoped variables with lazy evaluation, caching, and cycle detection.
//!
//! Every block owns a [`VarTable`]; name lookup walks the block's parent
//! chain. A [`VarNode`] holds a segmented expression whose `$(name)` parts
//! point at child nodes. Evaluation is lazy with per-node caching, rewrites
//! swap a node's contents atomically, and any mutation re-runs a DFS cycle
//! check from the changed root.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::block::{Ast, BlockId};
use super::expr::eval_expr;
use super::token::{Seg, Token};
use super::{ParseError, Result};

/// Reserved name under which `for`/`if`/`case`/`default` blocks store their
/// synthesized condition variable.
pub const RESERVED_CONDITION_VAR: &str = "_condition_expr_var";

/// Name of the reserved root that reads the process environment.
pub const ENV_ROOT: &str = "env";

/// Where a field view reads its value from.
#[derive(Debug, Clone)]
enum FieldSource {
    /// The process environment.
    Env,
    /// The `fields` map of another variable (a task's returned map).
    Var(Arc<VarNode>),
}

#[derive(Debug)]
struct VarInner {
    segments: Vec<Seg>,
    children: HashMap<String, Arc<VarNode>>,
    value: String,
    cached: bool,
    as_expr: bool,
    fields: HashMap<String, String>,
    view: Option<(FieldSource, String)>,
}

/// A single variable.
#[derive(Debug)]
pub struct VarNode {
    name: String,
    /// Line of the defining statement, for error reporting.
    line: usize,
    inner: Mutex<VarInner>,
}

impl VarNode {
    /// A variable backed by a segmented expression.
    pub fn new(name: impl Into<String>, line: usize, segments: Vec<Seg>, as_expr: bool) -> Self {
        Self {
            name: name.into(),
            line,
            inner: Mutex::new(VarInner {
                segments,
                children: HashMap::new(),
                value: String::new(),
                cached: false,
                as_expr,
                fields: HashMap::new(),
                view: None,
            }),
        }
    }

    /// A field view over `main.fields[field]` or the environment.
    fn field_view(name: &str, source: FieldSource, field: &str) -> Self {
        let node = Self::new(name, 0, Vec::new(), false);
        node.inner.lock().view = Some((source, field.to_string()));
        node
    }

    /// The variable's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defining source line.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Whether the last evaluation was cached.
    pub fn is_cached(&self) -> bool {
        self.inner.lock().cached
    }

    /// Names this node still needs resolved into child pointers.
    pub fn referenced_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .segments
            .iter()
            .filter_map(|seg| match seg {
                Seg::Var(name) => Some(name.clone()),
                Seg::Lit(_) => None,
            })
            .collect()
    }

    fn set_child(&self, name: &str, child: Arc<VarNode>) {
        self.inner.lock().children.insert(name.to_string(), child);
    }

    /// Write one key of a task's returned map into the `fields` map.
    pub fn add_field(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .fields
            .insert(key.to_string(), value.to_string());
    }

    /// Read a field previously written by [`VarNode::add_field`].
    pub fn field(&self, key: &str) -> Option<String> {
        self.inner.lock().fields.get(key).cloned()
    }

    /// Evaluate the variable to its string value.
    ///
    /// Field and environment views are always dynamic. Otherwise the cached
    /// value is returned when present; expression variables are re-evaluated
    /// on every call unless they have no children.
    pub fn calc(self: &Arc<Self>) -> Result<String> {
        // Snapshot under the lock, evaluate children without it.
        let (segments, children, as_expr) = {
            let inner = self.inner.lock();
            if let Some((source, field)) = &inner.view {
                return Ok(match source {
                    FieldSource::Env => std::env::var(field).unwrap_or_default(),
                    FieldSource::Var(main) => main.field(field).unwrap_or_default(),
                });
            }
            if inner.cached {
                return Ok(inner.value.clone());
            }
            (
                inner.segments.clone(),
                inner.children.clone(),
                inner.as_expr,
            )
        };

        let mut raw = String::new();
        let mut all_children_cached = true;
        let mut in_quotes = false;
        for seg in &segments {
            match seg {
                Seg::Lit(text) => {
                    raw.push_str(text);
                    in_quotes = track_quotes(text, in_quotes);
                }
                Seg::Var(name) => {
                    let child = children.get(name).ok_or_else(|| {
                        ParseError::UndefinedVariable {
                            line: self.line,
                            name: name.clone(),
                        }
                    })?;
                    let value = child.calc()?;
                    if !child.is_cached() {
                        all_children_cached = false;
                    }
                    if !as_expr {
                        raw.push_str(&value);
                    } else if in_quotes {
                        // Already inside a string literal of the expression.
                        raw.push_str(&value.replace('"', "\\\""));
                    } else {
                        raw.push_str(&quote_for_expr(&value));
                    }
                }
            }
        }

        let result = if as_expr { eval_expr(&raw)? } else { raw };

        let mut inner = self.inner.lock();
        if all_children_cached && (!as_expr || inner.children.is_empty()) {
            inner.value = result.clone();
            inner.cached = true;
        }
        Ok(result)
    }

    /// Replace the node's contents in one atomic swap.
    fn swap_contents(
        &self,
        segments: Vec<Seg>,
        children: HashMap<String, Arc<VarNode>>,
        as_expr: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.segments = segments;
        inner.children = children;
        inner.as_expr = as_expr;
        inner.value.clear();
        inner.cached = false;
    }

    fn children(&self) -> Vec<Arc<VarNode>> {
        let inner = self.inner.lock();
        let mut direct: Vec<Arc<VarNode>> = inner.children.values().cloned().collect();
        if let Some((FieldSource::Var(main), _)) = &inner.view {
            direct.push(main.clone());
        }
        direct
    }

    fn clear_cached(&self) {
        self.inner.lock().cached = false;
    }
}

/// Advance the inside-string-literal state across a literal chunk of an
/// expression source.
fn track_quotes(text: &str, mut in_quotes: bool) -> bool {
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            _ => {}
        }
    }
    in_quotes
}

/// Substitute a value into an expression source: numbers and booleans stay
/// bare, everything else is quoted so the evaluator sees one string operand.
fn quote_for_expr(value: &str) -> String {
    if value.parse::<f64>().is_ok() || value == "true" || value == "false" {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('"', "\\\""))
    }
}

/// Per-block map of variable name to node.
#[derive(Debug, Default)]
pub struct VarTable {
    inner: Mutex<HashMap<String, Arc<VarNode>>>,
}

impl VarTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Introduce a name. Two definitions in the same block are an error.
    pub fn define(&self, node: VarNode) -> Result<Arc<VarNode>> {
        let mut inner = self.inner.lock();
        if inner.contains_key(node.name()) {
            return Err(ParseError::DuplicateVariable {
                line: node.line(),
                name: node.name().to_string(),
            });
        }
        let arc = Arc::new(node);
        inner.insert(arc.name().to_string(), arc.clone());
        Ok(arc)
    }

    /// Look up a name in this table only.
    pub fn get(&self, name: &str) -> Option<Arc<VarNode>> {
        self.inner.lock().get(name).cloned()
    }

    /// All nodes in this table.
    pub fn nodes(&self) -> Vec<Arc<VarNode>> {
        self.inner.lock().values().cloned().collect()
    }

    /// Number of defined variables.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Resolve `name` (plain or `main.field`) from `block`'s scope into a node.
///
/// Dotted references produce a field view; the reserved `env` root reads the
/// process environment.
pub fn resolve_ref(ast: &Ast, block: BlockId, name: &str, line: usize) -> Result<Arc<VarNode>> {
    if let Some((main, field)) = name.split_once('.') {
        if field.contains('.') {
            return Err(ParseError::MalformedFieldPath {
                text: format!("$({name})"),
            });
        }
        if main == ENV_ROOT {
            return Ok(Arc::new(VarNode::field_view(
                name,
                FieldSource::Env,
                field,
            )));
        }
        let main_node =
            ast.lookup_var(block, main)
                .ok_or_else(|| ParseError::UndefinedVariable {
                    line,
                    name: main.to_string(),
                })?;
        return Ok(Arc::new(VarNode::field_view(
            name,
            FieldSource::Var(main_node),
            field,
        )));
    }
    ast.lookup_var(block, name)
        .ok_or_else(|| ParseError::UndefinedVariable {
            line,
            name: name.to_string(),
        })
}

/// Wire every `$(name)` of `node`'s segments to a child pointer, resolving
/// from `block`'s scope.
pub fn resolve_children(ast: &Ast, block: BlockId, node: &Arc<VarNode>) -> Result<()> {
    for name in node.referenced_names() {
        let child = resolve_ref(ast, block, &name, node.line())?;
        node.set_child(&name, child);
    }
    Ok(())
}

/// Evaluate a token's value in `block`'s scope, substituting each variable
/// segment. Tokens without references evaluate to their text.
pub fn eval_token(ast: &Ast, block: BlockId, token: &Token) -> Result<String> {
    if token.segments.is_empty() {
        return Ok(token.text.clone());
    }
    let mut out = String::new();
    for seg in &token.segments {
        match seg {
            Seg::Lit(text) => out.push_str(text),
            Seg::Var(name) => {
                let node = resolve_ref(ast, block, name, token.line)?;
                out.push_str(&node.calc()?);
            }
        }
    }
    Ok(out)
}

/// Update an existing variable in place (`NAME <- expr`).
///
/// The target is resolved through the parent walk. A self-reference on the
/// right-hand side is substituted with the variable's current value before
/// the new segments are built, so `x <- $(x) + 1` increments. After the
/// atomic swap the cycle check re-runs from the changed node and the cached
/// flag of every transitive dependent is cleared.
pub fn rewrite(
    ast: &Ast,
    block: BlockId,
    name: &str,
    segments: Vec<Seg>,
    as_expr: bool,
) -> Result<()> {
    let target = ast
        .lookup_var(block, name)
        .ok_or_else(|| ParseError::UndefinedVariable { line: 0, name: name.to_string() })?;

    let current = target.calc()?;
    let segments: Vec<Seg> = segments
        .into_iter()
        .map(|seg| match seg {
            Seg::Var(n) if n == name => Seg::Lit(current.clone()),
            other => other,
        })
        .collect();

    let mut children = HashMap::new();
    for seg in &segments {
        if let Seg::Var(n) = seg {
            children.insert(n.clone(), resolve_ref(ast, block, n, target.line())?);
        }
    }

    target.swap_contents(segments, children, as_expr);
    detect_cycle_from(&target)?;

    for node in ast.all_var_nodes() {
        if !std::ptr::eq(Arc::as_ptr(&node), Arc::as_ptr(&target)) && depends_on(&node, &target) {
            node.clear_cached();
        }
    }
    Ok(())
}

/// DFS from `root`; revisiting a node already on the traversal stack is a
/// cycle and fatal.
pub fn detect_cycle_from(root: &Arc<VarNode>) -> Result<()> {
    fn visit(node: &Arc<VarNode>, stack: &mut Vec<*const VarNode>) -> Result<()> {
        let ptr = Arc::as_ptr(node);
        if stack.contains(&ptr) {
            return Err(ParseError::VariableCycle {
                name: node.name().to_string(),
            });
        }
        stack.push(ptr);
        for child in node.children() {
            visit(&child, stack)?;
        }
        stack.pop();
        Ok(())
    }
    visit(root, &mut Vec::new())
}

fn depends_on(node: &Arc<VarNode>, target: &Arc<VarNode>) -> bool {
    let mut stack = node.children();
    let mut seen: Vec<*const VarNode> = Vec::new();
    while let Some(next) = stack.pop() {
        let ptr = Arc::as_ptr(&next);
        if ptr == Arc::as_ptr(target) {
            return true;
        }
        if seen.contains(&ptr) {
            continue;
        }
        seen.push(ptr);
        stack.extend(next.children());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::token::segment;

    fn literal(name: &str, value: &str) -> VarNode {
        VarNode::new(name, 1, vec![Seg::Lit(value.to_string())], false)
    }

    #[test]
    fn literal_evaluates_and_caches() {
        let table = VarTable::new();
        let a = table.define(literal("a", "100")).unwrap();
        assert_eq!(a.calc().unwrap(), "100");
        assert!(a.is_cached());
        assert_eq!(a.calc().unwrap(), "100");
    }

    #[test]
    fn duplicate_definition_rejected() {
        let table = VarTable::new();
        table.define(literal("a", "1")).unwrap();
        assert!(matches!(
            table.define(literal("a", "2")),
            Err(ParseError::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn child_substitution() {
        let table = VarTable::new();
        let a = table.define(literal("a", "world")).unwrap();
        let b = table
            .define(VarNode::new("b", 2, segment("hello $(a)").unwrap(), false))
            .unwrap();
        b.set_child("a", a);
        assert_eq!(b.calc().unwrap(), "hello world");
        assert!(b.is_cached());
    }

    #[test]
    fn expr_var_with_children_is_not_cached() {
        let table = VarTable::new();
        let a = table.define(literal("a", "1")).unwrap();
        let b = table
            .define(VarNode::new("b", 2, segment("$(a) + 1").unwrap(), true))
            .unwrap();
        b.set_child("a", a);
        assert_eq!(b.calc().unwrap(), "2");
        assert!(!b.is_cached());
    }

    #[test]
    fn field_views_are_dynamic() {
        let table = VarTable::new();
        let t = table.define(literal("t", "")).unwrap();
        let view = Arc::new(VarNode::field_view(
            "t.Now",
            FieldSource::Var(t.clone()),
            "Now",
        ));
        assert_eq!(view.calc().unwrap(), "");
        t.add_field("Now", "2038-01-19");
        assert_eq!(view.calc().unwrap(), "2038-01-19");
        assert!(!view.is_cached());
    }

    #[test]
    fn cycle_is_detected() {
        let table = VarTable::new();
        let a = table
            .define(VarNode::new("a", 1, segment("$(b)").unwrap(), false))
            .unwrap();
        let b = table
            .define(VarNode::new("b", 2, segment("$(a)").unwrap(), false))
            .unwrap();
        a.set_child("b", b.clone());
        b.set_child("a", a.clone());
        assert!(matches!(
            detect_cycle_from(&a),
            Err(ParseError::VariableCycle { .. })
        ));
    }
}
