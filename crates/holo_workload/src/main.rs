//! Workload driver for slot migration across HoloShard clusters.
//!
//! `run` drives a list-append workload against RESP clusters and writes the
//! history, `migrate` moves a slot range between RESP clusters, `simulate`
//! runs the whole migration scenario in process, and `check` verifies a
//! recorded history.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_shard::migration::{MigrationConfig, MigrationCoordinator};
use holo_shard::operator::{begin_migration, finish_migration, reconfigure};
use holo_shard::resp::{RespCluster, RespClusterConfig};
use holo_shard::{ClusterId, ClusterStore, Slot, MAX_SLOT};
use holo_workload::{
    run_scenario, tagged_keys, CheckerConfig, GeneratorConfig, History, HistoryMeta,
    HistoryRecorder, LinearizabilityChecker, OperationGenerator, RelocationMode, ScenarioConfig,
    Topology,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
    Migrate(MigrateArgs),
    Simulate(SimulateArgs),
    Check(CheckArgs),
}

/// Workload shape shared by `run` and `simulate`.
#[derive(clap::Args, Debug, Clone)]
struct WorkloadArgs {
    /// Number of concurrent processes.
    #[arg(long, default_value_t = 5)]
    processes: usize,

    /// Number of keys; all share the hash tag so they live in one slot.
    #[arg(long, default_value_t = 5)]
    keys: usize,

    /// Hash tag shared by every key (`{tag}key0`, `{tag}key1`, ...).
    #[arg(long, default_value = "test")]
    tag: String,

    /// Percent of operations that are reads (rest are appends).
    #[arg(long, default_value_t = 50)]
    read_pct: u8,

    /// Total operations; 0 runs until --duration.
    #[arg(long, default_value_t = 500)]
    ops: u64,

    /// Upper bound on the workload runtime.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, env = "HOLO_WORKLOAD_SEED", default_value_t = 0)]
    seed: u64,

    /// Upper bound on explored checker states per key.
    #[arg(long, default_value_t = 1_000_000)]
    max_states: u64,
}

impl WorkloadArgs {
    fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            processes: self.processes,
            keys: tagged_keys(&self.tag, self.keys),
            read_pct: self.read_pct,
            ops: self.ops,
            duration: self.duration.into(),
            seed: self.seed,
            ..GeneratorConfig::default()
        }
    }

    fn checker(&self) -> CheckerConfig {
        CheckerConfig {
            max_states: self.max_states,
        }
    }
}

/// CLI options for running the workload against RESP clusters.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Comma-separated RESP endpoints, one per cluster, e.g. `127.0.0.1:16379,127.0.0.1:26379`
    #[arg(long, env = "HOLO_CLUSTERS")]
    clusters: String,

    #[command(flatten)]
    workload: WorkloadArgs,

    /// Per-request timeout (network + server response).
    #[arg(long, default_value = "2s")]
    op_timeout: humantime::Duration,

    /// Write the JSON history to this path.
    #[arg(long, default_value = ".tmp/linearizability/history.json")]
    out: PathBuf,

    /// Check the history after the run.
    #[arg(long, default_value_t = false)]
    check: bool,
}

/// CLI options for moving a slot range between RESP clusters.
#[derive(Parser, Debug, Clone)]
struct MigrateArgs {
    /// Comma-separated RESP endpoints, one per cluster.
    #[arg(long, env = "HOLO_CLUSTERS")]
    clusters: String,

    /// Cluster id (dbid) giving up the slots.
    #[arg(long)]
    from: String,

    /// Cluster id (dbid) receiving the slots.
    #[arg(long)]
    to: String,

    /// Slot or inclusive slot range, e.g. `6918` or `0-8191`.
    #[arg(long)]
    slots: String,

    /// Migration phases to run.
    #[arg(long, value_enum, default_value = "all")]
    stage: MigrateStage,

    /// Keys scanned and relocated per batch.
    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    #[arg(long, default_value = "2s")]
    op_timeout: humantime::Duration,
}

/// Phases of a slot migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum MigrateStage {
    Begin,
    Drain,
    Finish,
    All,
}

/// CLI options for the in-process migration scenario.
#[derive(Parser, Debug, Clone)]
struct SimulateArgs {
    #[command(flatten)]
    workload: WorkloadArgs,

    /// How keys move between clusters.
    #[arg(long, value_enum, default_value = "atomic")]
    relocation: Relocation,

    /// Replicas per cluster.
    #[arg(long, default_value_t = 3)]
    replicas: usize,

    /// Simulated latency of every cluster request.
    #[arg(long, default_value = "200us")]
    op_latency: humantime::Duration,

    /// Pause between migration phases.
    #[arg(long, default_value = "5ms")]
    phase_pause: humantime::Duration,

    /// Keys relocated per batch.
    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Optionally write the JSON history to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Relocation strategy for `simulate`.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Relocation {
    Atomic,
    NonAtomicCopy,
}

/// CLI options for checking a recorded history.
#[derive(Parser, Debug, Clone)]
struct CheckArgs {
    /// History JSON written by `run` or `simulate`.
    #[arg(long, default_value = ".tmp/linearizability/history.json")]
    history: PathBuf,

    #[arg(long, default_value_t = 1_000_000)]
    max_states: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
        Command::Migrate(args) => migrate(args).await,
        Command::Simulate(args) => simulate(args).await,
        Command::Check(args) => check(args),
    }
}

/// Run the workload against RESP clusters and write the history file.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = RespClusterConfig {
        op_timeout: args.op_timeout.into(),
        ..RespClusterConfig::default()
    };
    let stores = connect_all(&args.clusters, &config).await?;
    let cluster_ids: Vec<String> = stores.iter().map(|s| s.cluster_id().to_string()).collect();
    let topology = Arc::new(Topology::new(stores));
    topology.refresh().await.context("read shard group tables")?;

    let generator_config = args.workload.generator();
    let recorder = Arc::new(HistoryRecorder::new());
    let generator = OperationGenerator::new(generator_config.clone(), topology, recorder.clone())?;
    let started = tokio::time::Instant::now();
    generator.run().await?;

    let meta = HistoryMeta {
        clusters: cluster_ids,
        keys: generator_config.keys,
        processes: generator_config.processes,
        read_pct: generator_config.read_pct,
        seed: generator.seed(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    drop(generator);
    let recorder = Arc::into_inner(recorder).context("history recorder is still shared")?;
    let history = recorder.close(meta);
    history.write_json(&args.out).context("write history")?;
    tracing::info!(path = %args.out.display(), ops = history.ops.len(), "wrote history");

    if args.check {
        check_history(&history, args.workload.checker())?;
    }
    Ok(())
}

/// Move a slot range between RESP clusters.
async fn migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let (start, end) = parse_slots(&args.slots)?;
    let (from, to) = (ClusterId::new(args.from.as_str()), ClusterId::new(args.to.as_str()));
    let config = RespClusterConfig {
        op_timeout: args.op_timeout.into(),
        ..RespClusterConfig::default()
    };
    let mut stores = connect_all(&args.clusters, &config).await?;
    let source = stores
        .iter()
        .find(|s| *s.cluster_id() == from)
        .cloned()
        .with_context(|| format!("no endpoint given for source cluster {from}"))?;
    anyhow::ensure!(
        stores.iter().any(|s| *s.cluster_id() == to),
        "no endpoint given for destination cluster {to}"
    );
    // REPLACE the destination first.
    stores.sort_by_key(|s| *s.cluster_id() != to);

    let topology = Topology::new(stores.clone());
    topology.refresh().await.context("read shard group tables")?;
    let mut table = topology.view();

    if matches!(args.stage, MigrateStage::Begin | MigrateStage::All) {
        let next = begin_migration(&table, &from, &to, start, end)?;
        table = reconfigure(&stores, &next).await.context("begin migration")?;
    }
    if matches!(args.stage, MigrateStage::Drain | MigrateStage::All) {
        let migration = MigrationConfig {
            batch_size: args.batch_size,
            ..MigrationConfig::default()
        };
        let reports = MigrationCoordinator::new(source, to.clone(), migration)
            .migrate_range(start, end)
            .await
            .context("drain slots")?;
        let moved: u64 = reports.iter().map(|r| r.keys_moved).sum();
        tracing::info!(start, end, keys_moved = moved, "slots drained");
    }
    if matches!(args.stage, MigrateStage::Finish | MigrateStage::All) {
        let next = finish_migration(&table, &from, &to, start, end)?;
        reconfigure(&stores, &next).await.context("finish migration")?;
    }
    Ok(())
}

/// Run the in-process migration scenario.
async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config = ScenarioConfig {
        generator: args.workload.generator(),
        migration: MigrationConfig {
            batch_size: args.batch_size,
            retry_backoff: Duration::from_millis(1),
            ..MigrationConfig::default()
        },
        checker: args.workload.checker(),
        replicas: args.replicas,
        op_latency: args.op_latency.into(),
        phase_pause: args.phase_pause.into(),
        relocation: match args.relocation {
            Relocation::Atomic => RelocationMode::Atomic,
            Relocation::NonAtomicCopy => RelocationMode::NonAtomicCopy,
        },
        ..ScenarioConfig::default()
    };
    let outcome = run_scenario(config).await?;
    tracing::info!(
        slot = outcome.slot,
        keys_moved = outcome.migration.keys_moved,
        operations = outcome.stats.operations,
        "scenario finished"
    );
    for (key, values) in &outcome.final_lists {
        tracing::info!(key, length = values.len(), "final list");
    }
    if let Some(path) = &args.out {
        outcome.history.write_json(path).context("write history")?;
        tracing::info!(path = %path.display(), "wrote history");
    }
    let report = outcome.check?;
    tracing::info!(keys = report.keys, ops = report.checked_ops, "linearizable");
    Ok(())
}

/// Check a recorded history file.
fn check(args: CheckArgs) -> anyhow::Result<()> {
    let history = History::read_json(&args.history)?;
    check_history(
        &history,
        CheckerConfig {
            max_states: args.max_states,
        },
    )
}

fn check_history(history: &History, config: CheckerConfig) -> anyhow::Result<()> {
    let report = LinearizabilityChecker::new(config).check(history)?;
    tracing::info!(
        keys = report.keys,
        checked = report.checked_ops,
        optional = report.optional_ops,
        dropped = report.dropped_ops,
        states = report.states,
        "history is linearizable"
    );
    Ok(())
}

/// Connect to every comma-separated endpoint.
async fn connect_all(
    input: &str,
    config: &RespClusterConfig,
) -> anyhow::Result<Vec<Arc<dyn ClusterStore>>> {
    let mut out: Vec<Arc<dyn ClusterStore>> = Vec::new();
    for part in input.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let cluster = RespCluster::connect(part, config.clone())
            .await
            .with_context(|| format!("connect to {part}"))?;
        tracing::info!(address = part, cluster_id = %cluster.cluster_id(), "connected");
        out.push(Arc::new(cluster));
    }
    anyhow::ensure!(!out.is_empty(), "--clusters must not be empty");
    Ok(out)
}

/// Parse `N` or `N-M` into an inclusive slot range.
fn parse_slots(input: &str) -> anyhow::Result<(Slot, Slot)> {
    let parse = |s: &str| -> anyhow::Result<Slot> {
        let slot: Slot = s
            .trim()
            .parse()
            .with_context(|| format!("invalid slot {s:?}"))?;
        anyhow::ensure!(slot <= MAX_SLOT, "slot {slot} out of range");
        Ok(slot)
    };
    let (start, end) = match input.split_once('-') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let slot = parse(input)?;
            (slot, slot)
        }
    };
    anyhow::ensure!(start <= end, "empty slot range {input:?}");
    Ok((start, end))
}
