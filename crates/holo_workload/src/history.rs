//! Operation history captured during a workload run.
//!
//! Times are nanoseconds since the recorder was created, taken from a
//! monotonic clock. `invoked_at` is captured just before the request is
//! dispatched and `completed_at` just after its outcome is known, so an
//! operation's real-time interval always contains its effect.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Operation kind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Read,
    Append,
}

/// Outcome of an operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// Append applied; `length` is the list length it produced.
    Appended { length: u64 },
    /// Whole list observed by a read.
    Read { values: Vec<String> },
    /// Definitely not applied.
    Failed { error: String },
    /// May or may not have been applied.
    Unknown { error: String },
}

impl Outcome {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Outcome::Unknown { .. })
    }
}

/// One completed operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: u64,
    pub process: u64,
    pub key: String,
    pub kind: OpKind,
    /// Appended value; `None` for reads.
    pub value: Option<String>,
    pub invoked_at: u64,
    pub completed_at: u64,
    /// Cluster that produced the outcome (diagnostic only).
    pub cluster: String,
    pub outcome: Outcome,
}

/// Run parameters stored alongside the operations for reproducibility.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryMeta {
    pub clusters: Vec<String>,
    pub keys: Vec<String>,
    pub processes: usize,
    pub read_pct: u8,
    pub seed: u64,
    pub duration_ms: u64,
}

/// Closed history, ordered by invocation time.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub meta: HistoryMeta,
    pub ops: Vec<Operation>,
}

impl History {
    /// Distinct keys in first-invocation order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for op in &self.ops {
            if !keys.contains(&op.key.as_str()) {
                keys.push(&op.key);
            }
        }
        keys
    }

    /// Serialize as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(self).context("serialize history")?;
        std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("parse history {}", path.display()))
    }
}

/// An operation that has been invoked but not completed.
#[derive(Debug)]
#[must_use = "an invocation must be completed to enter the history"]
pub struct Invocation {
    id: u64,
    process: u64,
    key: String,
    kind: OpKind,
    value: Option<String>,
    invoked_at: u64,
}

/// Append-only operation log shared by every workload process.
pub struct HistoryRecorder {
    start: Instant,
    next_id: AtomicU64,
    ops: Mutex<Vec<Operation>>,
}

impl Default for HistoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryRecorder {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            next_id: AtomicU64::new(0),
            ops: Mutex::new(Vec::new()),
        }
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Stamp the invocation time of an operation about to be dispatched.
    pub fn invoke(
        &self,
        process: u64,
        key: impl Into<String>,
        kind: OpKind,
        value: Option<String>,
    ) -> Invocation {
        Invocation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            process,
            key: key.into(),
            kind,
            value,
            invoked_at: self.now(),
        }
    }

    /// Stamp completion and append the finished operation.
    pub fn complete(&self, invocation: Invocation, cluster: &str, outcome: Outcome) {
        let completed_at = self.now().max(invocation.invoked_at);
        let op = Operation {
            id: invocation.id,
            process: invocation.process,
            key: invocation.key,
            kind: invocation.kind,
            value: invocation.value,
            invoked_at: invocation.invoked_at,
            completed_at,
            cluster: cluster.to_string(),
            outcome,
        };
        self.ops.lock().push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the recorder and return the immutable history.
    pub fn close(self, meta: HistoryMeta) -> History {
        let mut ops = self.ops.into_inner();
        ops.sort_by_key(|op| (op.invoked_at, op.id));
        History { meta, ops }
    }
}
