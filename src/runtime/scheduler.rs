//! Flow scheduler: owns flows and drives their run queues.
//!
//! One pass walks the queue batch by batch. Every batch member gets its own
//! worker; a buffered result channel sized to the batch forms the step
//! barrier. Per-task condition gating, fn-local rewrites, retry and
//! ignore-failure policy, and return-value capture all happen on the result
//! path. Event-driven flows re-run the main body every time a trigger fires,
//! until cancelled.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::driver::{ArgMap, DriverError, Labels, OutcomeSink, Resources};
use crate::parser::{self, vars};

use super::error::{Result, RuntimeError};
use super::flow::{Flow, FlowId, FlowStatus, NodeStatus};
use super::insight::FlowRunningInsight;
use super::logbucket::LogBucket;
use super::queue::{self, QueueWalker, TaskNode};
use super::store::FlowStore;

/// Outcome of one worker run.
enum WorkerOutcome {
    /// The gating condition was false; the driver was not called.
    NotExecuted,
    /// The driver returned a map.
    Done(ArgMap),
    /// The driver failed.
    Failed(String),
    /// The `exit` directive fired.
    Exit(String),
}

/// Owns the flow store and executes flows.
#[derive(Default)]
pub struct Scheduler {
    store: FlowStore,
}

impl Scheduler {
    /// A scheduler with an empty flow store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `source`, compile it, and register the flow under a stable id.
    pub fn parse_flow(&self, name: &str, source: &str) -> Result<FlowId> {
        let ast = parser::parse(source)?;
        let queue = queue::compile(&ast)?;
        let id = FlowId::new(name, source);
        info!(flow_id = %id, blocks = ast.len(), "flow parsed");
        self.store.add(Flow::new(id.clone(), ast, queue));
        Ok(id)
    }

    /// Load every task node's driver, allocate statistics, and mark the flow
    /// ready. `bucket` supplies the per-node log writers.
    pub async fn init_flow(&self, id: &FlowId, bucket: LogBucket) -> Result<()> {
        let flow = self.store.get(id)?;
        if flow.status() != FlowStatus::Added {
            return Err(RuntimeError::InvalidStatus {
                flow: id.to_string(),
                status: flow.status().to_string(),
                expected: FlowStatus::Added.to_string(),
            });
        }
        flow.set_bucket(bucket);
        let bucket = flow.bucket();
        let outcomes = Arc::new(OutcomeSink::new());
        for task in flow.queue.all_tasks() {
            let resources = Resources {
                labels: Labels {
                    flow_id: id.to_string(),
                    seq: task.seq,
                    node_name: task.name.clone(),
                },
                log: bucket.writer(task.seq)?,
                outcomes: outcomes.clone(),
            };
            task.driver.load(resources).await?;
        }
        flow.allocate_stats();
        flow.set_status(FlowStatus::Ready);
        info!(flow_id = %id, "flow ready");
        Ok(())
    }

    /// Execute the flow: event mode when an `event` block exists, otherwise
    /// one pass over the queue.
    #[instrument(name = "exec_flow", skip(self), fields(flow_id = %id))]
    pub async fn exec_flow(&self, id: &FlowId) -> Result<()> {
        let flow = self.store.get(id)?;
        match flow.status() {
            FlowStatus::Ready => {}
            // A stopped flow can be replayed.
            FlowStatus::Stopped => flow.to_ready()?,
            other => {
                return Err(RuntimeError::InvalidStatus {
                    flow: id.to_string(),
                    status: other.to_string(),
                    expected: FlowStatus::Ready.to_string(),
                });
            }
        }

        let cancel = CancellationToken::new();
        flow.set_cancel(cancel.clone());
        flow.mark_begin();
        info!("flow started");

        let result = if flow.queue.event_tasks.is_empty() {
            self.run_pass(&flow, &cancel).await
        } else {
            self.run_event_loop(&flow, &cancel).await
        };

        match &result {
            Ok(()) => {
                flow.mark_end(FlowStatus::Stopped, None);
                info!("flow stopped");
            }
            Err(RuntimeError::Cancelled(cause)) => {
                flow.mark_end(FlowStatus::Cancelled, Some(cause.clone()));
                warn!(cause = %cause, "flow cancelled");
            }
            Err(err) => {
                flow.mark_end(FlowStatus::Killed, Some(err.to_string()));
                error!(error = %err, "flow killed");
            }
        }
        result
    }

    /// Cancel the running pass of a flow.
    pub fn cancel_running_flow(&self, id: &FlowId) -> Result<()> {
        let flow = self.store.get(id)?;
        if !flow.cancel() {
            return Err(RuntimeError::InvalidStatus {
                flow: id.to_string(),
                status: flow.status().to_string(),
                expected: FlowStatus::Running.to_string(),
            });
        }
        Ok(())
    }

    /// Read-only snapshot of a flow for UIs.
    pub fn inspect_flow(&self, id: &FlowId) -> Result<FlowRunningInsight> {
        Ok(self.store.get(id)?.insight())
    }

    /// Cancel a running flow, or mark an idle one stopped.
    pub fn stop_flow(&self, id: &FlowId) -> Result<()> {
        let flow = self.store.get(id)?;
        if !flow.cancel() {
            flow.set_status(FlowStatus::Stopped);
        }
        Ok(())
    }

    /// Remove a flow that is not running.
    pub fn delete_flow(&self, id: &FlowId) -> Result<()> {
        let flow = self.store.get(id)?;
        if flow.status() == FlowStatus::Running {
            return Err(RuntimeError::InvalidStatus {
                flow: id.to_string(),
                status: flow.status().to_string(),
                expected: FlowStatus::Stopped.to_string(),
            });
        }
        self.store.remove(id)
    }

    /// Ids of every registered flow.
    pub fn flow_ids(&self) -> Vec<FlowId> {
        self.store.ids()
    }

    /// Direct access to a flow's shared state (log bucket, insight).
    pub fn flow(&self, id: &FlowId) -> Result<Arc<Flow>> {
        self.store.get(id)
    }

    /// One pass over the queue with a strict step barrier between batches.
    async fn run_pass(&self, flow: &Arc<Flow>, cancel: &CancellationToken) -> Result<()> {
        // Pre-execution hook: file-scope rewrites.
        queue::run_block_statements(&flow.ast, flow.ast.global())?;

        let queue = flow.queue.clone();
        let mut walker = QueueWalker::new(&queue, &flow.ast);
        while let Some(batch) = walker.next_batch()? {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled("before step".into()));
            }
            self.run_batch(flow, batch, cancel).await?;
        }
        Ok(())
    }

    /// Run one batch: spawn a worker per member, drain one result per
    /// spawned worker, apply retry/ignore policy.
    async fn run_batch(
        &self,
        flow: &Arc<Flow>,
        batch: Vec<TaskNode>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let step = batch.first().map(|t| t.step).unwrap_or(0);
        let batch_cancel = cancel.child_token();
        // Stops still-running siblings when this function returns early.
        let _guard = batch_cancel.clone().drop_guard();

        let (tx, mut rx) = mpsc::channel::<(TaskNode, WorkerOutcome)>(batch.len().max(1));
        let mut remaining = 0usize;
        for task in batch {
            spawn_worker(flow, task, &batch_cancel, tx.clone());
            remaining += 1;
        }

        let mut step_error: Option<String> = None;
        while remaining > 0 {
            let received = tokio::select! {
                msg = rx.recv() => msg,
                _ = cancel.cancelled() => {
                    return Err(RuntimeError::Cancelled("during step".into()));
                }
            };
            let Some((task, outcome)) = received else { break };
            remaining -= 1;

            let Some(stats) = flow.stats(task.seq) else { continue };
            match outcome {
                WorkerOutcome::NotExecuted => {
                    // condition-false never surfaces to the user.
                    stats.finish(NodeStatus::NotExecuted, None, false);
                    flow.node_done(task.seq);
                    debug!(node = %task.name, seq = task.seq, "not executed");
                }
                WorkerOutcome::Done(output) => {
                    stats.finish(NodeStatus::Stopped, None, true);
                    flow.node_done(task.seq);
                    if let Some(var) = &task.return_var {
                        if let Some(node) = flow.ast.lookup_var(task.co_block, var) {
                            for (key, value) in &output {
                                node.add_field(key, value);
                            }
                        }
                    }
                }
                WorkerOutcome::Exit(message) => {
                    stats.finish(NodeStatus::Stopped, Some(message.clone()), true);
                    flow.node_done(task.seq);
                    return Err(RuntimeError::Exit(message));
                }
                WorkerOutcome::Failed(detail) => {
                    stats.finish(NodeStatus::Error, Some(detail.clone()), true);
                    let manifest = task.driver.manifest();
                    if manifest.retry_on_failure > 0 && stats.runs() <= manifest.retry_on_failure {
                        debug!(node = %task.name, runs = stats.runs(), "retrying");
                        spawn_worker(flow, task, &batch_cancel, tx.clone());
                        remaining += 1;
                        continue;
                    }
                    flow.node_done(task.seq);
                    if manifest.ignore_failure {
                        debug!(node = %task.name, error = %detail, "failure ignored");
                    } else if step_error.is_none() {
                        step_error = Some(detail);
                    }
                }
            }
        }

        if let Some(detail) = step_error {
            return Err(RuntimeError::StepFailed { step, detail });
        }
        Ok(())
    }

    /// Event mode: the `event` block is the loop condition, the main body is
    /// the loop body.
    async fn run_event_loop(&self, flow: &Arc<Flow>, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled("event loop".into()));
            }

            let triggers = flow.queue.event_tasks.clone();
            let total = triggers.len();
            let trigger_cancel = cancel.child_token();
            let (tx, mut rx) = mpsc::channel::<(TaskNode, WorkerOutcome)>(total.max(1));
            for task in triggers {
                spawn_worker(flow, task, &trigger_cancel, tx.clone());
            }
            drop(tx);

            let mut fired = false;
            let mut failures = 0usize;
            loop {
                let received = tokio::select! {
                    msg = rx.recv() => msg,
                    _ = cancel.cancelled() => {
                        trigger_cancel.cancel();
                        return Err(RuntimeError::Cancelled("waiting for trigger".into()));
                    }
                };
                let Some((task, outcome)) = received else { break };
                let Some(stats) = flow.stats(task.seq) else { continue };
                match outcome {
                    WorkerOutcome::Done(output) => {
                        stats.finish(NodeStatus::Stopped, None, true);
                        flow.node_done(task.seq);
                        if let Some(var) = &task.return_var {
                            if let Some(node) = flow.ast.lookup_var(task.co_block, var) {
                                for (key, value) in &output {
                                    node.add_field(key, value);
                                }
                            }
                        }
                        // First completion wins; cancel the sibling triggers.
                        trigger_cancel.cancel();
                        fired = true;
                        break;
                    }
                    WorkerOutcome::Exit(message) => {
                        trigger_cancel.cancel();
                        return Err(RuntimeError::Exit(message));
                    }
                    WorkerOutcome::NotExecuted | WorkerOutcome::Failed(_) => {
                        stats.finish(NodeStatus::Error, None, true);
                        flow.node_done(task.seq);
                        failures += 1;
                        if failures == total {
                            return Err(RuntimeError::StepFailed {
                                step: 0,
                                detail: "every event trigger failed".into(),
                            });
                        }
                    }
                }
            }
            if !fired {
                return Err(RuntimeError::Cancelled("event triggers exhausted".into()));
            }

            debug!("event fired, re-running flow body");
            flow.to_ready()?;
            flow.set_status(FlowStatus::Running);
            self.run_pass(flow, cancel).await?;
        }
    }
}

/// Flip the node to running and hand it to a fresh worker task.
fn spawn_worker(
    flow: &Arc<Flow>,
    task: TaskNode,
    cancel: &CancellationToken,
    tx: mpsc::Sender<(TaskNode, WorkerOutcome)>,
) {
    if let Some(stats) = flow.stats(task.seq) {
        stats.begin_run();
    }
    flow.node_running(task.seq);
    let flow = flow.clone();
    let token = cancel.child_token();
    tokio::spawn(async move {
        let outcome = run_task(&flow, &task, token).await;
        let _ = tx.send((task, outcome)).await;
    });
}

/// Execute one task: gate on conditions, re-run fn-local rewrites, evaluate
/// args, and invoke the driver.
async fn run_task(flow: &Arc<Flow>, task: &TaskNode, cancel: CancellationToken) -> WorkerOutcome {
    for (_, cond) in flow.ast.enclosing_conditions(task.co_block) {
        match cond.calc() {
            Ok(value) if value == "true" => {}
            Ok(_) => return WorkerOutcome::NotExecuted,
            Err(err) => return WorkerOutcome::Failed(err.to_string()),
        }
    }

    if let Some(fn_block) = task.fn_block {
        if let Err(err) = queue::run_block_statements(&flow.ast, fn_block) {
            return WorkerOutcome::Failed(err.to_string());
        }
    }

    let mut args = ArgMap::new();
    for arg in &task.args {
        match vars::eval_token(&flow.ast, arg.scope, &arg.value) {
            Ok(value) => {
                args.insert(arg.key.clone(), value);
            }
            Err(err) => return WorkerOutcome::Failed(err.to_string()),
        }
    }

    let merged = task.driver.merge_args(args);
    match task.driver.run(cancel, merged).await {
        Ok(output) => WorkerOutcome::Done(output),
        Err(DriverError::Exit(message)) => WorkerOutcome::Exit(message),
        Err(err) => WorkerOutcome::Failed(err.to_string()),
    }
}
