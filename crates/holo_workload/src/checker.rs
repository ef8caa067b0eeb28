//! Linearizability checker for list-append histories.
//!
//! Linearizability is local, so each key is checked on its own against a list
//! model: an append with reply length `n` is legal iff the list currently has
//! `n - 1` elements, a read is legal iff it observed exactly the current list.
//!
//! The search is Wing & Gong's: repeatedly pick an operation that no other
//! pending operation finished before, apply it to the model, and backtrack on
//! dead ends. Visited `(linearized set, list)` pairs are memoized. Operations
//! with an unknown outcome are handled the Jepsen way: unknown reads carry no
//! information and are dropped, unknown appends may take effect at any point
//! after their invocation or never.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use holo_shard::slot_of;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::{History, OpKind, Operation, Outcome};

#[derive(Clone, Debug)]
pub struct CheckerConfig {
    /// Upper bound on distinct search states per key.
    pub max_states: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_states: 1_000_000,
        }
    }
}

/// Summary of a passing check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub keys: usize,
    /// Operations that had to be linearized.
    pub checked_ops: usize,
    /// Unknown appends that could be linearized or left out.
    pub optional_ops: usize,
    /// Failed operations and unknown reads.
    pub dropped_ops: usize,
    pub states: u64,
}

/// An operation that no linearization can explain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub key: String,
    pub op: Operation,
    pub observed: String,
    pub expected: String,
    /// Operations linearized before the search got stuck.
    pub linearized: usize,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key {}: op {} ({:?} by process {} on {}) observed {}, expected {} after {} linearized ops",
            self.key,
            self.op.id,
            self.op.kind,
            self.op.process,
            self.op.cluster,
            self.observed,
            self.expected,
            self.linearized
        )
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("consistency violation: {0}")]
    ConsistencyViolation(Box<Violation>),
    #[error("search budget exceeded on key {key}: more than {max_states} states")]
    SearchBudgetExceeded { key: String, max_states: u64 },
}

pub struct LinearizabilityChecker {
    config: CheckerConfig,
}

impl LinearizabilityChecker {
    pub fn new(config: CheckerConfig) -> Self {
        Self { config }
    }

    /// Check every key of a closed history.
    pub fn check(&self, history: &History) -> Result<CheckReport, CheckError> {
        let mut by_key: BTreeMap<&str, Vec<&Operation>> = BTreeMap::new();
        for op in &history.ops {
            by_key.entry(op.key.as_str()).or_default().push(op);
        }
        let slots: BTreeSet<_> = by_key.keys().map(|k| slot_of(k.as_bytes())).collect();
        if slots.len() > 1 {
            tracing::warn!(
                keys = by_key.len(),
                slots = slots.len(),
                "checked keys do not share one hash slot"
            );
        }

        let mut report = CheckReport {
            keys: by_key.len(),
            ..CheckReport::default()
        };
        for (key, ops) in by_key {
            let model = KeyModel::build(&ops);
            report.checked_ops += model.required;
            report.optional_ops += model.entries.len() - model.required;
            report.dropped_ops += model.dropped;
            let states = model.search(key, self.config.max_states)?;
            tracing::debug!(key, ops = model.entries.len(), states, "key is linearizable");
            report.states += states;
        }
        tracing::info!(
            keys = report.keys,
            checked = report.checked_ops,
            optional = report.optional_ops,
            dropped = report.dropped_ops,
            states = report.states,
            "history is linearizable"
        );
        Ok(report)
    }
}

#[derive(Debug)]
enum Step {
    Append { value: u32, length: Option<u64> },
    Read { values: Vec<u32> },
}

#[derive(Debug)]
struct Entry<'a> {
    op: &'a Operation,
    call: u64,
    ret: u64,
    optional: bool,
    step: Step,
}

/// Set of linearized entry indexes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct OpSet(Vec<u64>);

impl OpSet {
    fn new(len: usize) -> Self {
        Self(vec![0; len.div_ceil(64)])
    }

    fn contains(&self, idx: usize) -> bool {
        self.0[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn insert(&mut self, idx: usize) {
        self.0[idx / 64] |= 1 << (idx % 64);
    }
}

struct Frame {
    done: OpSet,
    required_done: usize,
    state: Vec<u32>,
    candidates: Vec<usize>,
    next: usize,
}

struct KeyModel<'a> {
    entries: Vec<Entry<'a>>,
    /// Interned values, indexed by id.
    values: Vec<String>,
    required: usize,
    dropped: usize,
}

impl<'a> KeyModel<'a> {
    fn build(ops: &[&'a Operation]) -> Self {
        let mut ids: HashMap<String, u32> = HashMap::new();
        let mut values: Vec<String> = Vec::new();
        let mut intern = |value: &str| -> u32 {
            if let Some(id) = ids.get(value) {
                return *id;
            }
            let id = values.len() as u32;
            values.push(value.to_string());
            ids.insert(value.to_string(), id);
            id
        };

        let mut entries = Vec::with_capacity(ops.len());
        let mut dropped = 0;
        for op in ops.iter().copied() {
            let value = op.value.as_deref().unwrap_or_default();
            let (step, optional) = match (op.kind, &op.outcome) {
                (OpKind::Append, Outcome::Appended { length }) => (
                    Step::Append {
                        value: intern(value),
                        length: Some(*length),
                    },
                    false,
                ),
                (OpKind::Append, Outcome::Unknown { .. }) => (
                    Step::Append {
                        value: intern(value),
                        length: None,
                    },
                    true,
                ),
                (OpKind::Read, Outcome::Read { values }) => (
                    Step::Read {
                        values: values.iter().map(|v| intern(v)).collect(),
                    },
                    false,
                ),
                (_, Outcome::Failed { .. }) | (OpKind::Read, Outcome::Unknown { .. }) => {
                    dropped += 1;
                    continue;
                }
                (kind, outcome) => {
                    tracing::warn!(id = op.id, ?kind, ?outcome, "dropping malformed operation");
                    dropped += 1;
                    continue;
                }
            };
            entries.push(Entry {
                op,
                call: op.invoked_at,
                ret: if optional { u64::MAX } else { op.completed_at },
                optional,
                step,
            });
        }
        entries.sort_by_key(|e| (e.call, e.op.id));
        let required = entries.iter().filter(|e| !e.optional).count();
        Self {
            entries,
            values,
            required,
            dropped,
        }
    }

    /// Indexes that may be linearized next: not yet linearized and invoked no
    /// later than the earliest completion among pending required entries.
    /// Required entries come first, earliest completion first.
    fn candidates(&self, done: &OpSet) -> Vec<usize> {
        let min_ret = self
            .entries
            .iter()
            .enumerate()
            .filter(|(idx, e)| !e.optional && !done.contains(*idx))
            .map(|(_, e)| e.ret)
            .min()
            .unwrap_or(u64::MAX);
        let mut out: Vec<usize> = (0..self.entries.len())
            .filter(|idx| !done.contains(*idx) && self.entries[*idx].call <= min_ret)
            .collect();
        out.sort_by_key(|idx| (self.entries[*idx].optional, self.entries[*idx].ret));
        out
    }

    fn apply(state: &[u32], step: &Step) -> Option<Vec<u32>> {
        match step {
            Step::Append { value, length } => {
                if length.is_some_and(|n| n != state.len() as u64 + 1) {
                    return None;
                }
                let mut next = state.to_vec();
                next.push(*value);
                Some(next)
            }
            Step::Read { values } => (values.as_slice() == state).then(|| state.to_vec()),
        }
    }

    /// Returns the number of states explored.
    fn search(&self, key: &str, max_states: u64) -> Result<u64, CheckError> {
        if self.required == 0 {
            return Ok(0);
        }
        let root_done = OpSet::new(self.entries.len());
        let mut memo: HashSet<(OpSet, Vec<u32>)> = HashSet::new();
        memo.insert((root_done.clone(), Vec::new()));
        let mut deepest = (0, root_done.clone(), Vec::new());
        let mut stack = vec![Frame {
            candidates: self.candidates(&root_done),
            done: root_done,
            required_done: 0,
            state: Vec::new(),
            next: 0,
        }];
        let mut states = 1u64;

        while let Some(frame) = stack.last_mut() {
            let Some(&idx) = frame.candidates.get(frame.next) else {
                stack.pop();
                continue;
            };
            frame.next += 1;
            let entry = &self.entries[idx];
            let Some(state) = Self::apply(&frame.state, &entry.step) else {
                continue;
            };
            let required_done = frame.required_done + usize::from(!entry.optional);
            if required_done == self.required {
                return Ok(states);
            }
            let mut done = frame.done.clone();
            done.insert(idx);
            if !memo.insert((done.clone(), state.clone())) {
                continue;
            }
            states += 1;
            if states > max_states {
                return Err(CheckError::SearchBudgetExceeded {
                    key: key.to_string(),
                    max_states,
                });
            }
            if required_done > deepest.0 {
                deepest = (required_done, done.clone(), state.clone());
            }
            stack.push(Frame {
                candidates: self.candidates(&done),
                done,
                required_done,
                state,
                next: 0,
            });
        }

        let (linearized, done, state) = deepest;
        Err(CheckError::ConsistencyViolation(Box::new(
            self.violation(key, linearized, &done, &state),
        )))
    }

    /// Blame the pending required entry that must linearize soonest and
    /// cannot, falling back to the soonest one.
    fn violation(&self, key: &str, linearized: usize, done: &OpSet, state: &[u32]) -> Violation {
        let mut pending: Vec<&Entry<'_>> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(idx, e)| !e.optional && !done.contains(*idx))
            .map(|(_, e)| e)
            .collect();
        pending.sort_by_key(|e| (e.ret, e.op.id));
        let blamed = pending
            .iter()
            .find(|e| Self::apply(state, &e.step).is_none())
            .or_else(|| pending.first())
            .copied()
            .unwrap_or(&self.entries[0]);

        let (observed, expected) = match &blamed.step {
            Step::Append { length, .. } => (
                format!("length {}", length.unwrap_or_default()),
                format!("length {}", state.len() + 1),
            ),
            Step::Read { values } => (self.render(values), self.render(state)),
        };
        Violation {
            key: key.to_string(),
            op: blamed.op.clone(),
            observed,
            expected,
            linearized,
        }
    }

    fn render(&self, ids: &[u32]) -> String {
        let items: Vec<&str> = ids
            .iter()
            .map(|id| self.values[*id as usize].as_str())
            .collect();
        format!("[{}]", items.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryMeta;

    struct Builder {
        ops: Vec<Operation>,
    }

    impl Builder {
        fn new() -> Self {
            Self { ops: Vec::new() }
        }

        fn push(&mut self, kind: OpKind, value: Option<&str>, call: u64, ret: u64, outcome: Outcome) -> u64 {
            let id = self.ops.len() as u64;
            self.ops.push(Operation {
                id,
                process: id,
                key: "{t}k".to_string(),
                kind,
                value: value.map(str::to_string),
                invoked_at: call,
                completed_at: ret,
                cluster: "c1".to_string(),
                outcome,
            });
            id
        }

        fn append(&mut self, value: &str, call: u64, ret: u64, length: u64) -> u64 {
            self.push(OpKind::Append, Some(value), call, ret, Outcome::Appended { length })
        }

        fn read(&mut self, values: &[&str], call: u64, ret: u64) -> u64 {
            let values = values.iter().map(|v| v.to_string()).collect();
            self.push(OpKind::Read, None, call, ret, Outcome::Read { values })
        }

        fn check(&self) -> Result<CheckReport, CheckError> {
            self.check_with(CheckerConfig::default())
        }

        fn check_with(&self, config: CheckerConfig) -> Result<CheckReport, CheckError> {
            let mut ops = self.ops.clone();
            ops.sort_by_key(|op| (op.invoked_at, op.id));
            let history = History {
                meta: HistoryMeta::default(),
                ops,
            };
            LinearizabilityChecker::new(config).check(&history)
        }
    }

    fn violation(result: Result<CheckReport, CheckError>) -> Violation {
        match result {
            Err(CheckError::ConsistencyViolation(v)) => *v,
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn sequential_history_passes() {
        let mut h = Builder::new();
        h.append("1", 0, 10, 1);
        h.append("2", 20, 30, 2);
        h.read(&["1", "2"], 40, 50);
        let report = h.check().unwrap();
        assert_eq!(report.keys, 1);
        assert_eq!(report.checked_ops, 3);
    }

    #[test]
    fn overlapping_appends_may_commit_in_either_order() {
        let mut h = Builder::new();
        h.append("1", 0, 100, 2);
        h.append("2", 10, 90, 1);
        h.read(&["2", "1"], 200, 210);
        h.check().unwrap();
    }

    #[test]
    fn stale_read_is_flagged() {
        let mut h = Builder::new();
        h.append("1", 0, 10, 1);
        let read = h.read(&[], 20, 30);
        let v = violation(h.check());
        assert_eq!(v.op.id, read);
        assert_eq!(v.observed, "[]");
        assert_eq!(v.expected, "[1]");
        assert_eq!(v.linearized, 1);
    }

    #[test]
    fn duplicate_lengths_are_flagged() {
        let mut h = Builder::new();
        h.append("1", 0, 10, 1);
        let second = h.append("2", 20, 30, 1);
        let v = violation(h.check());
        assert_eq!(v.op.id, second);
        assert_eq!(v.observed, "length 1");
        assert_eq!(v.expected, "length 2");
    }

    #[test]
    fn unknown_append_may_or_may_not_take_effect() {
        let mut h = Builder::new();
        h.append("1", 0, 10, 1);
        h.push(
            OpKind::Append,
            Some("2"),
            20,
            30,
            Outcome::Unknown {
                error: "reply lost".into(),
            },
        );
        h.read(&["1"], 40, 50);
        h.read(&["1", "2"], 1_000, 1_010);
        h.append("3", 2_000, 2_010, 3);
        let report = h.check().unwrap();
        assert_eq!(report.optional_ops, 1);

        let mut never = Builder::new();
        never.append("1", 0, 10, 1);
        never.push(
            OpKind::Append,
            Some("2"),
            20,
            30,
            Outcome::Unknown {
                error: "timeout".into(),
            },
        );
        never.read(&["1"], 40, 50);
        never.append("3", 60, 70, 2);
        never.check().unwrap();
    }

    #[test]
    fn failed_append_must_stay_invisible() {
        let mut h = Builder::new();
        h.append("1", 0, 10, 1);
        h.push(
            OpKind::Append,
            Some("2"),
            20,
            30,
            Outcome::Failed {
                error: "TRYAGAIN".into(),
            },
        );
        h.push(
            OpKind::Read,
            None,
            25,
            26,
            Outcome::Unknown {
                error: "timeout".into(),
            },
        );
        let read = h.read(&["1", "2"], 40, 50);
        let v = violation(h.check());
        assert_eq!(v.op.id, read);
        assert_eq!(v.expected, "[1]");
    }

    #[test]
    fn copy_left_on_both_clusters_is_flagged() {
        let mut h = Builder::new();
        h.append("1", 0, 10, 1);
        h.append("2", 20, 30, 2);
        // Copied to the destination here; the source keeps serving.
        h.append("3", 40, 50, 3);
        let stale = h.read(&["1", "2"], 60, 70);
        let v = violation(h.check());
        assert_eq!(v.op.id, stale);
        assert_eq!(v.observed, "[1, 2]");
        assert_eq!(v.expected, "[1, 2, 3]");
    }

    #[test]
    fn keys_are_checked_independently() {
        let mut h = Builder::new();
        h.append("1", 0, 10, 1);
        h.read(&["1"], 20, 30);
        let mut other = h.ops[0].clone();
        other.id = 100;
        other.key = "{t}other".to_string();
        other.outcome = Outcome::Appended { length: 1 };
        h.ops.push(other);
        let report = h.check().unwrap();
        assert_eq!(report.keys, 2);
        assert_eq!(report.checked_ops, 3);
    }

    #[test]
    fn search_budget_is_enforced() {
        let mut h = Builder::new();
        h.append("1", 0, 100, 1);
        h.append("2", 0, 100, 2);
        h.append("3", 0, 100, 3);
        h.read(&["1", "2", "3"], 200, 210);
        let err = h.check_with(CheckerConfig { max_states: 2 }).unwrap_err();
        assert!(matches!(err, CheckError::SearchBudgetExceeded { max_states: 2, .. }));
    }
}
