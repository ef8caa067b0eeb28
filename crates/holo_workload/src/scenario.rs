//! In-process migration scenario: two clusters, a concurrent list-append
//! workload, and one slot moved from `c1` to `c2` while it runs.
//!
//! Phases:
//! 1. install a table giving `c1` every slot and seed each key with appends
//! 2. start the workload
//! 3. begin the migration, relocate the slot, append once more to every key,
//!    finish the migration
//! 4. wait for the workload, read every key once, check the history

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use holo_shard::local::{LocalCluster, LocalClusterConfig, LocalNetwork};
use holo_shard::migration::{MigrationConfig, MigrationCoordinator, MigrationReport};
use holo_shard::operator::{begin_migration, finish_migration, reconfigure};
use holo_shard::{
    slot_of, ClusterId, ClusterStore, ShardGroupEntry, ShardGroupTable, Slot, SlotRange, MAX_SLOT,
};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use crate::checker::{CheckError, CheckReport, CheckerConfig, LinearizabilityChecker};
use crate::generator::{GeneratorConfig, GeneratorStats, OperationGenerator};
use crate::history::{History, HistoryMeta, HistoryRecorder, Outcome};
use crate::topology::Topology;

/// How keys are moved between the begin and finish REPLACEs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationMode {
    /// Lock, import and delete per batch through the coordinator.
    #[default]
    Atomic,
    /// Copy values to the destination and leave the source serving them.
    /// Writes landing on the source after the copy are lost.
    NonAtomicCopy,
}

#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub generator: GeneratorConfig,
    pub migration: MigrationConfig,
    pub checker: CheckerConfig,
    /// Appends per key before the workload starts.
    pub initial_appends: u64,
    pub replicas: usize,
    pub op_latency: Duration,
    /// Pause between migration phases so workload traffic lands in each.
    pub phase_pause: Duration,
    pub relocation: RelocationMode,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            migration: MigrationConfig::default(),
            checker: CheckerConfig::default(),
            initial_appends: 10,
            replicas: 3,
            op_latency: Duration::from_micros(200),
            phase_pause: Duration::from_millis(5),
            relocation: RelocationMode::Atomic,
        }
    }
}

pub struct ScenarioOutcome {
    pub slot: Slot,
    pub history: History,
    pub migration: MigrationReport,
    pub stats: GeneratorStats,
    /// Result of the final read of every key.
    pub final_lists: BTreeMap<String, Vec<String>>,
    pub check: Result<CheckReport, CheckError>,
}

pub async fn run_scenario(config: ScenarioConfig) -> anyhow::Result<ScenarioOutcome> {
    let keys = config.generator.keys.clone();
    let first = keys.first().context("key pool must not be empty")?;
    let slot = slot_of(first.as_bytes());
    anyhow::ensure!(
        keys.iter().all(|k| slot_of(k.as_bytes()) == slot),
        "workload keys must share one hash slot"
    );

    let started = Instant::now();
    let network = LocalNetwork::new();
    let (id1, id2) = (ClusterId::new("c1"), ClusterId::new("c2"));
    let start = |id: &ClusterId| {
        LocalCluster::start(
            &network,
            LocalClusterConfig::new(id.as_str())
                .with_replicas(config.replicas)
                .with_op_latency(config.op_latency),
        )
    };
    let (c1, c2) = (start(&id1), start(&id2));
    // Destination first: it imports before the source starts redirecting,
    // and owns the slot before the source stops serving it.
    let stores: Vec<Arc<dyn ClusterStore>> = vec![c2.clone(), c1.clone()];

    let initial = ShardGroupTable::from_entries([
        shard_group(&id1, config.replicas).with_range(SlotRange::stable(0, MAX_SLOT, 1)),
        shard_group(&id2, config.replicas),
    ]);
    let table = reconfigure(&stores, &initial)
        .await
        .context("install initial table")?;
    let topology = Arc::new(Topology::new(stores.clone()));
    topology.refresh().await.context("initial topology refresh")?;

    let recorder = Arc::new(HistoryRecorder::new());
    let generator =
        OperationGenerator::new(config.generator.clone(), topology.clone(), recorder.clone())?;
    tracing::info!(
        slot,
        keys = keys.len(),
        seed = generator.seed(),
        relocation = ?config.relocation,
        "scenario starting"
    );

    let mut setup = generator.new_process();
    for key in &keys {
        for _ in 0..config.initial_appends {
            if generator.append(setup, key).await.is_unknown() {
                setup = generator.new_process();
            }
        }
    }

    let workload = {
        let generator = generator.clone();
        tokio::spawn(async move { generator.run().await })
    };
    time::sleep(config.phase_pause).await;

    let begin = begin_migration(&table, &id1, &id2, slot, slot)?;
    let table = reconfigure(&stores, &begin)
        .await
        .context("begin migration")?;
    time::sleep(config.phase_pause).await;

    let migration = match config.relocation {
        RelocationMode::Atomic => {
            MigrationCoordinator::new(c1.clone(), id2.clone(), config.migration.clone())
                .migrate_slot(slot)
                .await
                .context("migrate slot")?
        }
        RelocationMode::NonAtomicCopy => {
            copy_slot(&c1, &c2, slot, config.migration.batch_size).await?
        }
    };

    // One write per key routed while the slot is still migrating.
    let mut late = generator.new_process();
    for key in &keys {
        if generator.append(late, key).await.is_unknown() {
            late = generator.new_process();
        }
    }
    time::sleep(config.phase_pause).await;

    let finish = finish_migration(&table, &id1, &id2, slot, slot)?;
    let table = reconfigure(&stores, &finish)
        .await
        .context("finish migration")?;
    tracing::info!(
        slot,
        term = table.get(&id2).map_or(0, ShardGroupEntry::term),
        "migration finished"
    );

    let stats = workload.await.context("workload task panicked")??;

    topology.refresh().await.context("final topology refresh")?;
    let reader = generator.new_process();
    let mut final_lists = BTreeMap::new();
    for key in &keys {
        match generator.read(reader, key).await {
            Outcome::Read { values } => {
                final_lists.insert(key.clone(), values);
            }
            other => anyhow::bail!("final read of {key} did not complete: {other:?}"),
        }
    }

    let meta = HistoryMeta {
        clusters: vec![id1.to_string(), id2.to_string()],
        keys: keys.clone(),
        processes: config.generator.processes,
        read_pct: config.generator.read_pct,
        seed: generator.seed(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    drop(generator);
    let recorder = Arc::into_inner(recorder).context("history recorder is still shared")?;
    let history = recorder.close(meta);
    let check = LinearizabilityChecker::new(config.checker.clone()).check(&history);
    match &check {
        Ok(report) => tracing::info!(
            ops = report.checked_ops,
            states = report.states,
            "history is linearizable"
        ),
        Err(err) => tracing::warn!(error = %err, "history check failed"),
    }

    Ok(ScenarioOutcome {
        slot,
        history,
        migration,
        stats,
        final_lists,
        check,
    })
}

fn shard_group(id: &ClusterId, replicas: usize) -> ShardGroupEntry {
    (1..=replicas).fold(ShardGroupEntry::new(id.clone()), |entry, idx| {
        entry.with_replica(format!("{id}{idx:08}"), format!("local://{id}/{idx}"))
    })
}

/// Copy every key of `slot` to `destination` without locking or deleting it
/// on `source`.
async fn copy_slot(
    source: &LocalCluster,
    destination: &LocalCluster,
    slot: Slot,
    batch_size: usize,
) -> anyhow::Result<MigrationReport> {
    let mut report = MigrationReport {
        slot,
        ..MigrationReport::default()
    };
    let mut cursor = 0;
    loop {
        let page = source.scan_slot(cursor, slot, batch_size).await?;
        let entries: Vec<_> = page
            .keys
            .iter()
            .filter_map(|key| source.local_value(key).map(|value| (key.clone(), value)))
            .collect();
        if entries.is_empty() {
            if page.next_cursor != 0 {
                report.empty_pages += 1;
            }
        } else {
            report.batches += 1;
            report.keys_moved += entries.len() as u64;
            destination.import_keys(entries).await?;
        }
        if page.next_cursor == 0 {
            break;
        }
        cursor = page.next_cursor;
    }
    tracing::warn!(slot, keys = report.keys_moved, "slot copied without removing source keys");
    Ok(report)
}
