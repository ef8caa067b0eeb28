//! Ordered command log shared by the replicas of one cluster.
//!
//! Consensus itself is an external collaborator; this log provides only the
//! contract a committed consensus log gives its state machines: every replica
//! applies the same commands in the same order. Commands travel as opaque
//! bytes so replicas never share in-memory state with the proposer.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Metadata passed to a state machine for each committed command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecMeta {
    /// 1-based log index of the command.
    pub index: u64,
}

/// Replica state machine driven by the log.
pub trait StateMachine: Send + Sync + 'static {
    type Output: Send;

    /// Apply a committed command. Must be deterministic across replicas.
    fn apply(&self, data: &[u8], meta: ExecMeta) -> Self::Output;
}

/// Encode a log command.
pub fn encode_command<C: Serialize>(cmd: &C) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(cmd)?)
}

/// Decode a log command.
pub fn decode_command<C: DeserializeOwned>(data: &[u8]) -> anyhow::Result<C> {
    Ok(serde_json::from_slice(data)?)
}

/// In-process replicated log over a fixed replica set.
///
/// The first replica acts as leader: its output is returned to proposers and
/// reads are served from it.
pub struct ReplicatedLog<M: StateMachine> {
    replicas: Vec<Arc<M>>,
    entries: Mutex<Vec<Vec<u8>>>,
}

impl<M: StateMachine> ReplicatedLog<M> {
    /// Create a log over `replicas`. Panics if `replicas` is empty.
    pub fn new(replicas: Vec<Arc<M>>) -> Self {
        assert!(!replicas.is_empty(), "replicated log needs at least one replica");
        Self {
            replicas,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn leader(&self) -> &Arc<M> {
        &self.replicas[0]
    }

    pub fn replicas(&self) -> &[Arc<M>] {
        &self.replicas
    }

    /// Index of the last committed command.
    pub fn last_index(&self) -> u64 {
        self.entries.lock().len() as u64
    }

    /// Append `data` and apply it on every replica before returning.
    pub fn commit(&self, data: Vec<u8>) -> (ExecMeta, M::Output) {
        let mut entries = self.entries.lock();
        entries.push(data);
        let meta = ExecMeta {
            index: entries.len() as u64,
        };
        let data = &entries[entries.len() - 1];
        let output = self.replicas[0].apply(data, meta);
        for follower in &self.replicas[1..] {
            let _ = follower.apply(data, meta);
        }
        (meta, output)
    }

    /// Run a read against the leader, ordered with respect to commits.
    pub fn query<T>(&self, read: impl FnOnce(&M) -> T) -> T {
        let _entries = self.entries.lock();
        read(&self.replicas[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    enum Cmd {
        Push(u64),
    }

    #[derive(Default)]
    struct Recorder {
        applied: PlMutex<Vec<(u64, u64)>>,
    }

    impl StateMachine for Recorder {
        type Output = usize;

        fn apply(&self, data: &[u8], meta: ExecMeta) -> usize {
            let Cmd::Push(value) = decode_command(data).unwrap();
            let mut applied = self.applied.lock();
            applied.push((meta.index, value));
            applied.len()
        }
    }

    #[test]
    fn every_replica_applies_the_same_sequence() {
        let replicas = (0..3).map(|_| Arc::new(Recorder::default())).collect::<Vec<_>>();
        let log = ReplicatedLog::new(replicas.clone());
        for value in [7, 8, 9] {
            let (meta, out) = log.commit(encode_command(&Cmd::Push(value)).unwrap());
            assert_eq!(out as u64, meta.index);
        }
        assert_eq!(log.last_index(), 3);
        let expected = vec![(1, 7), (2, 8), (3, 9)];
        for replica in &replicas {
            assert_eq!(*replica.applied.lock(), expected);
        }
        assert_eq!(log.query(|leader| leader.applied.lock().len()), 3);
    }
}
