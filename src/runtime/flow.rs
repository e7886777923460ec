//! Flow state: status machine, per-node statistics, progress.
//!
//! A flow is one parsed program loaded for execution. Its identity is the
//! caller-provided name plus a content hash, so reparsing the same source
//! yields the same id. The flow struct is shared across the scheduler and
//! workers; the flow mutex guards status and progress, and every statistics
//! entry carries its own mutex.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::parser::Ast;

use super::insight::{FlowRunningInsight, NodeRunningInsight};
use super::logbucket::LogBucket;
use super::queue::RunQueue;

/// Stable flow identity: name plus content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId {
    /// Caller-provided name, usually derived from the source path.
    pub name: String,
    /// Truncated blake3 hash of the source text.
    pub hash: String,
}

impl FlowId {
    /// Derive an id from a name and the full source text.
    pub fn new(name: &str, source: &str) -> Self {
        let hash = blake3::hash(source.as_bytes()).to_hex();
        Self {
            name: name.to_string(),
            hash: hash[..12].to_string(),
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.hash)
    }
}

/// Flow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    /// Parsed and registered.
    Added,
    /// Every task node's driver is loaded.
    Ready,
    /// An execution pass is in progress.
    Running,
    /// The last pass finished cleanly.
    Stopped,
    /// The last pass ended with an error.
    Killed,
    /// Execution was cancelled.
    Cancelled,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Registered, not yet run in this pass.
    Created,
    /// A worker is executing the node.
    Running,
    /// The last run finished (successfully or with an ignored failure).
    Stopped,
    /// The last run failed.
    Error,
    /// The gating condition was false; the driver was not called.
    NotExecuted,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    status: Option<NodeStatus>,
    runs: u32,
    last_error: Option<String>,
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// Statistics entry of one task node, guarded by its own mutex.
#[derive(Debug)]
pub struct NodeStats {
    /// Sequence number.
    pub seq: usize,
    /// Step number.
    pub step: usize,
    /// Node name.
    pub name: String,
    /// Function name.
    pub fname: String,
    /// Driver kind name.
    pub driver: String,
    inner: Mutex<StatsInner>,
}

impl NodeStats {
    fn new(seq: usize, step: usize, name: &str, fname: &str, driver: &str) -> Self {
        Self {
            seq,
            step,
            name: name.to_string(),
            fname: fname.to_string(),
            driver: driver.to_string(),
            inner: Mutex::new(StatsInner {
                status: Some(NodeStatus::Created),
                ..Default::default()
            }),
        }
    }

    /// Flip to `Running` and stamp the begin time.
    pub fn begin_run(&self) {
        let mut inner = self.inner.lock();
        inner.status = Some(NodeStatus::Running);
        inner.begin = Some(Utc::now());
        inner.end = None;
    }

    /// Record a finished run.
    pub fn finish(&self, status: NodeStatus, error: Option<String>, counted: bool) {
        let mut inner = self.inner.lock();
        inner.status = Some(status);
        inner.end = Some(Utc::now());
        if counted {
            inner.runs += 1;
        }
        inner.last_error = error;
    }

    /// Completed runs, retries included.
    pub fn runs(&self) -> u32 {
        self.inner.lock().runs
    }

    /// Current status.
    pub fn status(&self) -> NodeStatus {
        self.inner.lock().status.unwrap_or(NodeStatus::Created)
    }

    /// Last recorded error.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = StatsInner {
            status: Some(NodeStatus::Created),
            ..Default::default()
        };
    }

    fn snapshot(&self) -> NodeRunningInsight {
        let inner = self.inner.lock();
        let duration_ms = match (inner.begin, inner.end) {
            (Some(begin), Some(end)) => (end - begin).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        NodeRunningInsight {
            seq: self.seq,
            step: self.step,
            name: self.name.clone(),
            function: self.fname.clone(),
            driver: self.driver.clone(),
            status: inner
                .status
                .unwrap_or(NodeStatus::Created)
                .to_string(),
            last_error: inner.last_error.clone(),
            runs: inner.runs,
            duration_ms,
        }
    }
}

#[derive(Debug)]
struct FlowInner {
    status: FlowStatus,
    last_error: Option<String>,
    begin: Option<DateTime<Utc>>,
    duration_ms: u64,
    running: HashSet<usize>,
    done: Vec<usize>,
}

/// One loaded flow.
pub struct Flow {
    /// Stable identity.
    pub id: FlowId,
    /// Parsed program.
    pub ast: Arc<Ast>,
    /// Compiled run queue.
    pub queue: Arc<RunQueue>,
    inner: Mutex<FlowInner>,
    stats: RwLock<BTreeMap<usize, Arc<NodeStats>>>,
    bucket: RwLock<Arc<LogBucket>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Flow {
    /// A freshly parsed flow in `Added` status.
    pub fn new(id: FlowId, ast: Ast, queue: RunQueue) -> Self {
        Self {
            id,
            ast: Arc::new(ast),
            queue: Arc::new(queue),
            inner: Mutex::new(FlowInner {
                status: FlowStatus::Added,
                last_error: None,
                begin: None,
                duration_ms: 0,
                running: HashSet::new(),
                done: Vec::new(),
            }),
            stats: RwLock::new(BTreeMap::new()),
            bucket: RwLock::new(Arc::new(LogBucket::memory())),
            cancel: Mutex::new(None),
        }
    }

    /// Current status.
    pub fn status(&self) -> FlowStatus {
        self.inner.lock().status
    }

    /// Set the status.
    pub fn set_status(&self, status: FlowStatus) {
        self.inner.lock().status = status;
    }

    /// Replace the log bucket (set by `init_flow` from the logger factory).
    pub fn set_bucket(&self, bucket: LogBucket) {
        *self.bucket.write() = Arc::new(bucket);
    }

    /// The flow's log bucket.
    pub fn bucket(&self) -> Arc<LogBucket> {
        self.bucket.read().clone()
    }

    /// Allocate one statistics entry per task node, keyed by seq.
    pub fn allocate_stats(&self) {
        let mut stats = self.stats.write();
        stats.clear();
        for task in self.queue.all_tasks() {
            stats.insert(
                task.seq,
                Arc::new(NodeStats::new(
                    task.seq,
                    task.step,
                    &task.name,
                    &task.fname,
                    task.driver.name(),
                )),
            );
        }
    }

    /// The statistics entry of `seq`.
    pub fn stats(&self, seq: usize) -> Option<Arc<NodeStats>> {
        self.stats.read().get(&seq).cloned()
    }

    /// Reset statistics and truncate the log bucket for replay.
    pub fn to_ready(&self) -> std::io::Result<()> {
        for stats in self.stats.read().values() {
            stats.reset();
        }
        self.bucket.read().reset()?;
        let mut inner = self.inner.lock();
        inner.status = FlowStatus::Ready;
        inner.last_error = None;
        inner.running.clear();
        inner.done.clear();
        Ok(())
    }

    /// Mark the start of an execution pass.
    pub fn mark_begin(&self) {
        let mut inner = self.inner.lock();
        inner.status = FlowStatus::Running;
        inner.begin = Some(Utc::now());
        inner.duration_ms = 0;
        inner.running.clear();
        inner.done.clear();
    }

    /// Mark the end of an execution pass.
    pub fn mark_end(&self, status: FlowStatus, error: Option<String>) {
        let mut inner = self.inner.lock();
        inner.status = status;
        inner.last_error = error;
        if let Some(begin) = inner.begin {
            inner.duration_ms = (Utc::now() - begin).num_milliseconds().max(0) as u64;
        }
        inner.running.clear();
    }

    /// Record that `seq` entered its worker.
    pub fn node_running(&self, seq: usize) {
        self.inner.lock().running.insert(seq);
    }

    /// Record that `seq` finished.
    pub fn node_done(&self, seq: usize) {
        let mut inner = self.inner.lock();
        inner.running.remove(&seq);
        if !inner.done.contains(&seq) {
            inner.done.push(seq);
        }
    }

    /// Install the cancellation token of the current pass.
    pub fn set_cancel(&self, token: CancellationToken) {
        *self.cancel.lock() = Some(token);
    }

    /// Cancel the current pass, if one is running.
    pub fn cancel(&self) -> bool {
        match &*self.cancel.lock() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Sample a read-only snapshot under one flow-mutex acquisition.
    pub fn insight(&self) -> FlowRunningInsight {
        let stats = self.stats.read();
        let inner = self.inner.lock();
        FlowRunningInsight {
            name: self.id.name.clone(),
            id: self.id.to_string(),
            status: inner.status.to_string(),
            last_error: inner.last_error.clone(),
            begin_time: inner.begin.map(|t| t.timestamp_millis()),
            duration_ms: inner.duration_ms,
            total: stats.len(),
            running: inner.running.len(),
            done: inner.done.len(),
            nodes: stats.values().map(|s| s.snapshot()).collect(),
        }
    }
}
