//! Read-only flow snapshots for UIs.
//!
//! A polling consumer fetches these instead of touching flow internals; all
//! fields are sampled under a single acquisition of the flow mutex.

use serde::{Deserialize, Serialize};

/// Snapshot of a running (or finished) flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunningInsight {
    /// Flow name.
    pub name: String,
    /// Stable flow id (name + content hash).
    pub id: String,
    /// Flow status name.
    pub status: String,
    /// Most recent error, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Millisecond UNIX timestamp of the last execution start.
    #[serde(default)]
    pub begin_time: Option<i64>,
    /// Duration of the last execution in milliseconds.
    pub duration_ms: u64,
    /// Total number of task nodes.
    pub total: usize,
    /// Number of nodes currently running.
    pub running: usize,
    /// Number of nodes finished in this pass.
    pub done: usize,
    /// Per-node details, ordered by sequence number.
    pub nodes: Vec<NodeRunningInsight>,
}

/// Snapshot of one task node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunningInsight {
    /// Queue-wide unique sequence number.
    pub seq: usize,
    /// 1-based step number; parallel siblings share it.
    pub step: usize,
    /// Node name (fn alias or function name).
    pub name: String,
    /// Function the node runs.
    pub function: String,
    /// Driver kind name.
    pub driver: String,
    /// Node status name.
    pub status: String,
    /// Most recent error, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Number of completed runs, retries included.
    pub runs: u32,
    /// Duration of the last run in milliseconds.
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_stable_json() {
        let insight = FlowRunningInsight {
            name: "demo".into(),
            id: "demo-abc123".into(),
            status: "Running".into(),
            last_error: None,
            begin_time: Some(1_700_000_000_000),
            duration_ms: 42,
            total: 2,
            running: 1,
            done: 1,
            nodes: vec![NodeRunningInsight {
                seq: 1,
                step: 1,
                name: "f1".into(),
                function: "function1".into(),
                driver: "go".into(),
                status: "Stopped".into(),
                last_error: None,
                runs: 1,
                duration_ms: 40,
            }],
        };
        let json = serde_json::to_string(&insight).unwrap();
        let back: FlowRunningInsight = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes.len(), 1);
        assert_eq!(back.nodes[0].function, "function1");
    }
}
