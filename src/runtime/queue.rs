//! Run-queue compiler.
//!
//! Lowers the block tree into a linear node sequence: `Task` nodes invoke a
//! function (possibly as part of a parallel group linked through sibling
//! pointers), `ForEnter` gates a loop with a forward jump, and `ForBack`
//! jumps back unconditionally. The walker re-evaluates the loop condition on
//! every pass and hands task batches to the runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::driver::{Driver, Location, builtin, registry};
use crate::parser::block::{Ast, BlockId, BlockKind, Body, StatementKind};
use crate::parser::token::{Token, TokenKind};
use crate::parser::vars::{self, RESERVED_CONDITION_VAR};

use super::error::{Result, RuntimeError};

/// One executable node of the queue.
#[derive(Debug, Clone)]
pub enum RunNode {
    /// Call one function.
    Task(TaskNode),
    /// Loop head: evaluates the condition, jumps past the matching
    /// [`RunNode::ForBack`] when it is false.
    ForEnter(ForEnter),
    /// Loop tail: unconditional backward jump to the matching head.
    ForBack(ForBack),
}

/// Loop head node.
#[derive(Debug, Clone)]
pub struct ForEnter {
    /// Index of the matching ForBack.
    pub back_index: usize,
    /// The `for` block, holding the condition variable and loop rewrites.
    pub block: BlockId,
}

/// Loop tail node.
#[derive(Debug, Clone)]
pub struct ForBack {
    /// Index of the matching ForEnter.
    pub enter_index: usize,
}

/// A single function invocation.
#[derive(Clone)]
pub struct TaskNode {
    /// Node name: the fn alias or the function name.
    pub name: String,
    /// Function the node runs.
    pub fname: String,
    /// Driver instance bound to this node.
    pub driver: Arc<dyn Driver>,
    /// The configuring `fn` block, when the node came from one.
    pub fn_block: Option<BlockId>,
    /// The originating `co` (or directive) block; argument and condition
    /// scope.
    pub co_block: BlockId,
    /// Variable receiving the returned map, from the `-> VAR` form.
    pub return_var: Option<String>,
    /// 1-based step; parallel siblings share it.
    pub step: usize,
    /// Queue-wide unique sequence number.
    pub seq: usize,
    /// Queue index of the next member of this parallel group.
    pub parallel: Option<usize>,
    /// Argument tokens. `fn` args come first, inline args override on key
    /// collision.
    pub args: Vec<TaskArg>,
}

/// One argument of a task, evaluated at run time in the scope it was
/// written in: the `args` block for fn-configured arguments, the `co`
/// block for inline ones.
#[derive(Debug, Clone)]
pub struct TaskArg {
    /// Argument name.
    pub key: String,
    /// Value token, substituted per run.
    pub value: Token,
    /// Block whose scope resolves the value's references.
    pub scope: BlockId,
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("fname", &self.fname)
            .field("driver", &self.driver.name())
            .field("step", &self.step)
            .field("seq", &self.seq)
            .field("parallel", &self.parallel)
            .finish()
    }
}

/// Compiled run queue.
#[derive(Debug, Default)]
pub struct RunQueue {
    /// Main body nodes in execution order.
    pub nodes: Vec<RunNode>,
    /// Trigger tasks of the `event` block, run as one batch per round.
    pub event_tasks: Vec<TaskNode>,
}

impl RunQueue {
    /// All task nodes of the main body, in queue order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter().filter_map(|node| match node {
            RunNode::Task(task) => Some(task),
            _ => None,
        })
    }

    /// Task nodes of the main body plus event triggers.
    pub fn all_tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.tasks().chain(self.event_tasks.iter())
    }

    /// Drive the queue once, handing each batch to `step_fn`.
    ///
    /// Runs the pre-execution hook (file-scope variable evaluation and
    /// rewrites) first. Per-task condition gating is the callback's job.
    pub fn execute<F>(&self, ast: &Ast, mut step_fn: F) -> Result<()>
    where
        F: FnMut(Vec<TaskNode>) -> Result<()>,
    {
        run_block_statements(ast, ast.global())?;
        let mut walker = QueueWalker::new(self, ast);
        while let Some(batch) = walker.next_batch()? {
            step_fn(batch)?;
        }
        Ok(())
    }
}

/// Stateful cursor over the queue implementing the jump semantics.
pub struct QueueWalker<'a> {
    queue: &'a RunQueue,
    ast: &'a Ast,
    index: usize,
}

impl<'a> QueueWalker<'a> {
    /// A walker positioned at the queue head.
    pub fn new(queue: &'a RunQueue, ast: &'a Ast) -> Self {
        Self {
            queue,
            ast,
            index: 0,
        }
    }

    /// The next task batch, or `None` when the queue is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Vec<TaskNode>>> {
        while self.index < self.queue.nodes.len() {
            match &self.queue.nodes[self.index] {
                RunNode::ForEnter(enter) => {
                    if self.loop_condition(enter.block)? {
                        self.index += 1;
                    } else {
                        self.index = enter.back_index + 1;
                    }
                }
                RunNode::ForBack(back) => {
                    // Loop rewrites take effect between iterations.
                    let RunNode::ForEnter(enter) = &self.queue.nodes[back.enter_index] else {
                        unreachable!("ForBack must point at a ForEnter");
                    };
                    run_block_statements(self.ast, enter.block)?;
                    self.index = back.enter_index;
                }
                RunNode::Task(task) => {
                    let mut batch = vec![task.clone()];
                    let mut cursor = task.parallel;
                    while let Some(next) = cursor {
                        let RunNode::Task(sibling) = &self.queue.nodes[next] else {
                            unreachable!("parallel pointer must link tasks");
                        };
                        batch.push(sibling.clone());
                        cursor = sibling.parallel;
                    }
                    self.index += batch.len();
                    return Ok(Some(batch));
                }
            }
        }
        Ok(None)
    }

    fn loop_condition(&self, block: BlockId) -> Result<bool> {
        match self.ast.block(block).vars.get(RESERVED_CONDITION_VAR) {
            None => Ok(true),
            Some(cond) => Ok(cond.calc()? == "true"),
        }
    }
}

/// Execute a block's `rewrite` statements in source order.
///
/// Used for the file-scope pre-execution hook, for `fn`-local rewrites
/// before each run, and for loop rewrites at the ForBack.
pub fn run_block_statements(ast: &Ast, block: BlockId) -> Result<()> {
    let Some(Body::Plain(stmts)) = &ast.block(block).body else {
        return Ok(());
    };
    for stmt in stmts {
        if stmt.kind != StatementKind::RewriteVar {
            continue;
        }
        let name = &stmt.tokens[0].text;
        let value = &stmt.tokens[2];
        vars::rewrite(
            ast,
            block,
            name,
            value.segments.clone(),
            value.kind == TokenKind::Expr,
        )?;
    }
    Ok(())
}

struct Template {
    fname: String,
    driver: Arc<dyn Driver>,
    fn_block: BlockId,
    args: Vec<TaskArg>,
}

/// Compile a validated AST into a run queue.
pub fn compile(ast: &Ast) -> Result<RunQueue> {
    let mut compiler = Compiler {
        ast,
        locations: HashMap::new(),
        templates: HashMap::new(),
        used_templates: HashSet::new(),
        nodes: Vec::new(),
        event_tasks: Vec::new(),
        step: 0,
        seq: 0,
    };
    compiler.load_pass()?;
    compiler.fn_pass()?;
    compiler.walk(ast.global())?;
    compiler.event_pass()?;
    Ok(RunQueue {
        nodes: compiler.nodes,
        event_tasks: compiler.event_tasks,
    })
}

struct Compiler<'a> {
    ast: &'a Ast,
    locations: HashMap<String, Location>,
    templates: HashMap<String, Template>,
    used_templates: HashSet<String>,
    nodes: Vec<RunNode>,
    event_tasks: Vec<TaskNode>,
    step: usize,
    seq: usize,
}

impl Compiler<'_> {
    /// Register every `load`ed function location, rejecting duplicates.
    fn load_pass(&mut self) -> Result<()> {
        let ast = self.ast;
        for id in ast.ids() {
            let block = ast.block(id);
            if block.kind != BlockKind::Load {
                continue;
            }
            let location = Location::parse(&block.target1.text)?;
            if self
                .locations
                .insert(location.fname.clone(), location.clone())
                .is_some()
            {
                return Err(RuntimeError::DuplicateFunction(location.fname));
            }
        }
        Ok(())
    }

    /// Instantiate a configured task template per `fn` block.
    fn fn_pass(&mut self) -> Result<()> {
        let ast = self.ast;
        for id in ast.ids() {
            let block = ast.block(id);
            if block.kind != BlockKind::Fn {
                continue;
            }
            let alias = block.target1.text.clone();
            let fname = block.target2.text.clone();
            let location = self
                .locations
                .get(&fname)
                .ok_or_else(|| RuntimeError::FunctionNotLoaded(fname.clone()))?;
            let driver = registry().create(location)?;
            let args = block
                .children
                .iter()
                .copied()
                .find(|&child| ast.block(child).kind == BlockKind::Args)
                .and_then(|child| {
                    let body = ast.block(child).body.as_ref()?;
                    Some(
                        body.pairs()
                            .iter()
                            .map(|(k, v)| TaskArg {
                                key: k.text.clone(),
                                value: v.clone(),
                                scope: child,
                            })
                            .collect::<Vec<_>>(),
                    )
                })
                .unwrap_or_default();
            self.templates.insert(
                alias,
                Template {
                    fname,
                    driver,
                    fn_block: id,
                    args,
                },
            );
        }
        Ok(())
    }

    fn walk(&mut self, block: BlockId) -> Result<()> {
        let ast = self.ast;
        for &child in &ast.block(block).children {
            match ast.block(child).kind {
                BlockKind::Co => self.emit_co(child)?,
                BlockKind::Directive => self.emit_directive(child)?,
                BlockKind::For => {
                    let enter_at = self.nodes.len();
                    self.nodes.push(RunNode::ForEnter(ForEnter {
                        back_index: 0,
                        block: child,
                    }));
                    self.walk(child)?;
                    let back_at = self.nodes.len();
                    self.nodes.push(RunNode::ForBack(ForBack {
                        enter_index: enter_at,
                    }));
                    if let RunNode::ForEnter(enter) = &mut self.nodes[enter_at] {
                        enter.back_index = back_at;
                    }
                }
                BlockKind::If | BlockKind::Switch | BlockKind::Case | BlockKind::Default => {
                    self.walk(child)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn emit_co(&mut self, co_block: BlockId) -> Result<()> {
        let block = self.ast.block(co_block);
        if let Some(Body::List(elements)) = &block.body {
            // Parallel group: one step, tasks linked through `parallel`.
            self.step += 1;
            let first_index = self.nodes.len();
            let count = elements.len();
            for (i, element) in elements.iter().enumerate() {
                self.seq += 1;
                let mut task = self.make_task(&element.text, co_block, None, Vec::new())?;
                task.step = self.step;
                task.seq = self.seq;
                if i + 1 < count {
                    task.parallel = Some(first_index + i + 1);
                }
                self.nodes.push(RunNode::Task(task));
            }
            return Ok(());
        }

        let name = block.target1.text.clone();
        let return_var = if block.target2.is_empty() {
            None
        } else {
            Some(block.target2.text.clone())
        };
        let inline_args: Vec<TaskArg> = block
            .body
            .as_ref()
            .map(|body| {
                body.pairs()
                    .iter()
                    .map(|(k, v)| TaskArg {
                        key: k.text.clone(),
                        value: v.clone(),
                        scope: co_block,
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.step += 1;
        self.seq += 1;
        let mut task = self.make_task(&name, co_block, return_var, inline_args)?;
        task.step = self.step;
        task.seq = self.seq;
        self.nodes.push(RunNode::Task(task));
        Ok(())
    }

    fn emit_directive(&mut self, block_id: BlockId) -> Result<()> {
        let ast = self.ast;
        let block = ast.block(block_id);
        let directive = block.target1.text.clone();
        let location = Location::parse(&format!("{}:{}", builtin::DRIVER_NAME, directive))?;
        let driver = registry().create(&location)?;

        let keys = builtin::arg_keys(&directive);
        let args = block
            .body
            .as_ref()
            .map(|body| {
                body.elements()
                    .iter()
                    .enumerate()
                    .map(|(i, tok)| TaskArg {
                        key: keys[i.min(keys.len() - 1)].to_string(),
                        value: tok.clone(),
                        scope: block_id,
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.step += 1;
        self.seq += 1;
        self.nodes.push(RunNode::Task(TaskNode {
            name: directive.clone(),
            fname: directive,
            driver,
            fn_block: None,
            co_block: block_id,
            return_var: None,
            step: self.step,
            seq: self.seq,
            parallel: None,
            args,
        }));
        Ok(())
    }

    /// Compile the `event` block's triggers into a separate batch.
    fn event_pass(&mut self) -> Result<()> {
        let ast = self.ast;
        let Some(event) = ast.ids().find(|&id| ast.block(id).kind == BlockKind::Event) else {
            return Ok(());
        };
        for &child in &ast.block(event).children {
            let block = ast.block(child);
            if block.kind != BlockKind::Co {
                continue;
            }
            let name = block.target1.text.clone();
            let return_var = if block.target2.is_empty() {
                None
            } else {
                Some(block.target2.text.clone())
            };
            let inline_args: Vec<TaskArg> = block
                .body
                .as_ref()
                .map(|body| {
                    body.pairs()
                        .iter()
                        .map(|(k, v)| TaskArg {
                            key: k.text.clone(),
                            value: v.clone(),
                            scope: child,
                        })
                        .collect()
                })
                .unwrap_or_default();
            self.seq += 1;
            let mut task = self.make_task(&name, child, return_var, inline_args)?;
            task.seq = self.seq;
            self.event_tasks.push(task);
        }
        Ok(())
    }

    fn make_task(
        &mut self,
        name: &str,
        co_block: BlockId,
        return_var: Option<String>,
        inline_args: Vec<TaskArg>,
    ) -> Result<TaskNode> {
        if let Some(template) = self.templates.get(name) {
            if !self.used_templates.insert(name.to_string()) {
                return Err(RuntimeError::NodeReused(name.to_string()));
            }
            let mut args = template.args.clone();
            for arg in inline_args {
                match args.iter_mut().find(|a| a.key == arg.key) {
                    Some(slot) => *slot = arg,
                    None => args.push(arg),
                }
            }
            return Ok(TaskNode {
                name: name.to_string(),
                fname: template.fname.clone(),
                driver: template.driver.clone(),
                fn_block: Some(template.fn_block),
                co_block,
                return_var,
                step: 0,
                seq: 0,
                parallel: None,
                args,
            });
        }

        let location = self
            .locations
            .get(name)
            .ok_or_else(|| RuntimeError::FunctionNotLoaded(name.to_string()))?;
        let driver = registry().create(location)?;
        Ok(TaskNode {
            name: name.to_string(),
            fname: name.to_string(),
            driver,
            fn_block: None,
            co_block,
            return_var,
            step: 0,
            seq: 0,
            parallel: None,
            args: inline_args,
        })
    }
}
