//! Concurrent list-append workload over a set of clusters.
//!
//! Each process issues one operation at a time against a small pool of keys
//! sharing a hash tag: either a whole-list read or an append of the key's next
//! value. The target cluster is re-resolved from the [`Topology`] for every
//! operation, so traffic follows slot ownership while it moves.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use holo_shard::{ClusterStore, RedirectKind, ShardError, ShardResult};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use crate::history::{HistoryRecorder, OpKind, Outcome};
use crate::topology::Topology;

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub processes: usize,
    pub keys: Vec<String>,
    /// Percent of operations that are reads.
    pub read_pct: u8,
    /// Total operations across all processes; 0 means until `duration`.
    pub ops: u64,
    pub duration: Duration,
    /// 0 picks a random seed.
    pub seed: u64,
    /// Retries of one operation on `TransientUnavailable` (TRYAGAIN, no owner).
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// MOVED/ASK hops followed by one operation.
    pub max_redirects: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            processes: 5,
            keys: tagged_keys("test", 5),
            read_pct: 50,
            ops: 500,
            duration: Duration::from_secs(10),
            seed: 0,
            max_retries: 100,
            retry_backoff: Duration::from_millis(2),
            max_redirects: 8,
        }
    }
}

/// `count` keys sharing the hash tag `tag`: `{tag}key0`, `{tag}key1`, ...
pub fn tagged_keys(tag: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{{{tag}}}key{i}")).collect()
}

/// Outcome counts of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorStats {
    pub operations: u64,
    pub appended: u64,
    pub reads: u64,
    pub failed: u64,
    pub unknown: u64,
    pub retired_processes: u64,
}

impl GeneratorStats {
    fn record(&mut self, outcome: &Outcome) {
        self.operations += 1;
        match outcome {
            Outcome::Appended { .. } => self.appended += 1,
            Outcome::Read { .. } => self.reads += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Unknown { .. } => self.unknown += 1,
        }
    }

    fn merge(&mut self, other: &GeneratorStats) {
        self.operations += other.operations;
        self.appended += other.appended;
        self.reads += other.reads;
        self.failed += other.failed;
        self.unknown += other.unknown;
        self.retired_processes += other.retired_processes;
    }
}

pub struct OperationGenerator {
    config: GeneratorConfig,
    seed: u64,
    topology: Arc<Topology>,
    recorder: Arc<HistoryRecorder>,
    /// Last value appended per key.
    counters: BTreeMap<String, AtomicU64>,
    issued: AtomicU64,
    next_process: AtomicU64,
}

impl OperationGenerator {
    pub fn new(
        config: GeneratorConfig,
        topology: Arc<Topology>,
        recorder: Arc<HistoryRecorder>,
    ) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(config.processes > 0, "processes must be > 0");
        anyhow::ensure!(!config.keys.is_empty(), "key pool must not be empty");
        anyhow::ensure!(config.read_pct <= 100, "read_pct must be <= 100");
        // Use a random seed when the caller provides zero.
        let seed = if config.seed == 0 {
            rand::thread_rng().gen()
        } else {
            config.seed
        };
        let counters = config
            .keys
            .iter()
            .map(|key| (key.clone(), AtomicU64::new(0)))
            .collect();
        Ok(Arc::new(Self {
            config,
            seed,
            topology,
            recorder,
            counters,
            issued: AtomicU64::new(0),
            next_process: AtomicU64::new(0),
        }))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Allocate a fresh process id.
    pub fn new_process(&self) -> u64 {
        self.next_process.fetch_add(1, Ordering::Relaxed)
    }

    /// Append the next value of `key` and record the operation.
    pub async fn append(&self, process: u64, key: &str) -> Outcome {
        let Some(counter) = self.counters.get(key) else {
            return Outcome::Failed {
                error: format!("key {key} is not in the workload key pool"),
            };
        };
        let value = (counter.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let invocation = self
            .recorder
            .invoke(process, key, OpKind::Append, Some(value.clone()));
        let (cluster, result) = self
            .dispatch(key, |store, asking| {
                let value = Bytes::from(value.clone());
                async move { store.append(key.as_bytes(), value, asking).await }
            })
            .await;
        let outcome = match result {
            Ok(length) => Outcome::Appended { length },
            Err(err) => error_outcome(err),
        };
        self.recorder.complete(invocation, &cluster, outcome.clone());
        outcome
    }

    /// Read the whole list at `key` and record the operation.
    pub async fn read(&self, process: u64, key: &str) -> Outcome {
        let invocation = self.recorder.invoke(process, key, OpKind::Read, None);
        let (cluster, result) = self
            .dispatch(key, |store, asking| async move {
                store.read_list(key.as_bytes(), asking).await
            })
            .await;
        let outcome = match result {
            Ok(values) => Outcome::Read {
                values: values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect(),
            },
            Err(err) => error_outcome(err),
        };
        self.recorder.complete(invocation, &cluster, outcome.clone());
        outcome
    }

    /// Run all processes until the operation budget or the duration runs out.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<GeneratorStats> {
        let deadline = Instant::now() + self.config.duration;
        let mut tasks = Vec::with_capacity(self.config.processes);
        for worker in 0..self.config.processes {
            let generator = self.clone();
            tasks.push(tokio::spawn(generator.run_process(worker, deadline)));
        }
        let mut stats = GeneratorStats::default();
        for task in tasks {
            stats.merge(&task.await.context("workload process panicked")?);
        }
        tracing::info!(
            seed = self.seed,
            operations = stats.operations,
            appended = stats.appended,
            reads = stats.reads,
            failed = stats.failed,
            unknown = stats.unknown,
            retired = stats.retired_processes,
            "workload finished"
        );
        Ok(stats)
    }

    async fn run_process(self: Arc<Self>, worker: usize, deadline: Instant) -> GeneratorStats {
        // Mix the base seed with the worker index for deterministic per-process RNG.
        let seed = self.seed ^ (worker as u64).wrapping_mul(0x9e3779b97f4a7c15);
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut process = self.new_process();
        let mut stats = GeneratorStats::default();
        loop {
            if Instant::now() >= deadline {
                break;
            }
            if self.config.ops > 0 && self.issued.fetch_add(1, Ordering::SeqCst) >= self.config.ops {
                break;
            }
            let key = &self.config.keys[rng.gen_range(0..self.config.keys.len())];
            let outcome = if rng.gen_range(0..100u8) < self.config.read_pct {
                self.read(process, key).await
            } else {
                self.append(process, key).await
            };
            stats.record(&outcome);
            if outcome.is_unknown() {
                // The process may still have an operation in flight; continue
                // under a new identity so each process stays sequential.
                let retired = process;
                process = self.new_process();
                stats.retired_processes += 1;
                tracing::debug!(retired, process, "process retired after indeterminate outcome");
            }
        }
        stats
    }

    /// Send one operation, following redirects and retrying transient errors.
    /// Returns the last cluster tried alongside the result.
    async fn dispatch<T, F, Fut>(&self, key: &str, op: F) -> (String, ShardResult<T>)
    where
        F: Fn(Arc<dyn ClusterStore>, bool) -> Fut,
        Fut: Future<Output = ShardResult<T>>,
    {
        let mut target = self.topology.route(key.as_bytes());
        let mut asking = false;
        let mut redirects = 0;
        let mut retries = 0;
        let mut cluster = String::new();
        loop {
            let result = match target.take() {
                Some(store) => {
                    cluster = store.cluster_id().to_string();
                    op(store, asking).await
                }
                None => Err(ShardError::TransientUnavailable(format!(
                    "no known owner for key {key}"
                ))),
            };
            asking = false;
            match result {
                Ok(value) => return (cluster, Ok(value)),
                Err(ShardError::Redirect(redirect)) if redirects < self.config.max_redirects => {
                    redirects += 1;
                    match redirect.kind {
                        RedirectKind::Moved => self.refresh_topology().await,
                        RedirectKind::Ask => asking = true,
                    }
                    target = self.topology.resolve(&redirect.location);
                    if target.is_none() {
                        asking = false;
                        target = self.topology.route(key.as_bytes());
                    }
                }
                Err(err) if err.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    time::sleep(self.config.retry_backoff).await;
                    if self.topology.route(key.as_bytes()).is_none() {
                        self.refresh_topology().await;
                    }
                    target = self.topology.route(key.as_bytes());
                }
                Err(err) => return (cluster, Err(err)),
            }
        }
    }

    async fn refresh_topology(&self) {
        if let Err(err) = self.topology.refresh().await {
            tracing::debug!(error = %err, "topology refresh failed");
        }
    }
}

fn error_outcome(err: ShardError) -> Outcome {
    if err.is_definite() {
        Outcome::Failed {
            error: err.to_string(),
        }
    } else {
        Outcome::Unknown {
            error: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckerConfig, LinearizabilityChecker};
    use crate::history::HistoryMeta;
    use holo_shard::local::{LocalCluster, LocalClusterConfig, LocalNetwork};
    use holo_shard::{ClusterId, ShardGroupEntry, ShardGroupTable, SlotRange, MAX_SLOT};

    async fn single_cluster() -> (Arc<LocalCluster>, Arc<Topology>) {
        let network = LocalNetwork::new();
        let c1 = LocalCluster::start(&network, LocalClusterConfig::new("c1"));
        let table = ShardGroupTable::from_entries([
            ShardGroupEntry::new(ClusterId::new("c1")).with_range(SlotRange::stable(0, MAX_SLOT, 1))
        ]);
        c1.configure_shard_groups(&table).await.unwrap();
        let stores: Vec<Arc<dyn ClusterStore>> = vec![c1.clone()];
        let topology = Arc::new(Topology::new(stores));
        topology.refresh().await.unwrap();
        (c1, topology)
    }

    fn config(read_pct: u8, ops: u64) -> GeneratorConfig {
        GeneratorConfig {
            processes: 4,
            keys: tagged_keys("gen", 3),
            read_pct,
            ops,
            seed: 7,
            ..GeneratorConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_produces_a_linearizable_history() {
        let (_c1, topology) = single_cluster().await;
        let recorder = Arc::new(HistoryRecorder::new());
        let generator = OperationGenerator::new(config(50, 120), topology, recorder.clone()).unwrap();
        let stats = generator.run().await.unwrap();
        assert_eq!(stats.operations, 120);
        assert_eq!(stats.failed + stats.unknown, 0);

        drop(generator);
        let recorder = Arc::into_inner(recorder).unwrap();
        let history = recorder.close(HistoryMeta::default());
        assert_eq!(history.ops.len(), 120);
        LinearizabilityChecker::new(CheckerConfig::default())
            .check(&history)
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_outcome_retires_the_process() {
        let (c1, topology) = single_cluster().await;
        let recorder = Arc::new(HistoryRecorder::new());
        let mut cfg = config(0, 20);
        cfg.processes = 1;
        let generator = OperationGenerator::new(cfg, topology, recorder.clone()).unwrap();
        c1.lose_next_reply();
        let stats = generator.run().await.unwrap();
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.retired_processes, 1);

        drop(generator);
        let history = Arc::into_inner(recorder).unwrap().close(HistoryMeta::default());
        let unknown = history.ops.iter().find(|op| op.outcome.is_unknown()).unwrap();
        assert!(history
            .ops
            .iter()
            .filter(|op| op.id > unknown.id)
            .all(|op| op.process != unknown.process));
        LinearizabilityChecker::new(CheckerConfig::default())
            .check(&history)
            .unwrap();
    }

    #[tokio::test]
    async fn keys_outside_the_pool_are_rejected() {
        let (_c1, topology) = single_cluster().await;
        let recorder = Arc::new(HistoryRecorder::new());
        let generator = OperationGenerator::new(config(0, 1), topology, recorder.clone()).unwrap();
        assert!(matches!(
            generator.append(0, "stray").await,
            Outcome::Failed { .. }
        ));
        assert!(recorder.is_empty());
    }
}
