//! End-to-end migration scenarios checked for linearizability.
//!
//! Test flow:
//! 1. Start two in-process clusters; `c1` owns every slot.
//! 2. Seed five keys sharing the `{test}` hash tag, start five processes
//!    appending to and reading them.
//! 3. Move the keys' slot to `c2` while the workload runs, append once more
//!    to every key mid-migration, and read every key at the end.
//! 4. Check the recorded history.
//!
//! Failure model covered:
//! - clients racing slot ownership changes (MOVED, ASK, TRYAGAIN)
//! - a relocation that copies keys but leaves the source serving them
//!
//! Verification:
//! - atomic relocation yields a linearizable history with no lost appends
//! - copy-without-delete loses acknowledged appends and the checker says so
//! - two seed appends per key all survive the move

mod common;

use std::collections::BTreeSet;

use holo_shard::slot_of;
use holo_workload::{
    run_scenario, CheckError, CheckerConfig, History, LinearizabilityChecker, RelocationMode,
    ScenarioConfig,
};

use common::{acknowledged_appends, scenario_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn atomic_migration_is_linearizable() {
    let outcome = run_scenario(scenario_config(RelocationMode::Atomic, 150))
        .await
        .expect("scenario");
    assert_eq!(outcome.slot, slot_of(b"{test}key0"));
    assert_eq!(outcome.migration.keys_moved, 5);
    assert_eq!(outcome.stats.unknown, 0);

    let report = match &outcome.check {
        Ok(report) => report.clone(),
        Err(err) => panic!("atomic migration must be linearizable: {err}"),
    };
    assert_eq!(report.keys, 5);

    for (key, values) in &outcome.final_lists {
        let acknowledged = acknowledged_appends(&outcome.history, key);
        assert_eq!(values.len(), acknowledged.len(), "lost appends on {key}");
        let stored: BTreeSet<&String> = values.iter().collect();
        assert_eq!(stored.len(), values.len(), "duplicate values on {key}");
        for value in &acknowledged {
            assert!(stored.contains(value), "{key} is missing {value}");
        }
    }
    for op in &outcome.history.ops {
        assert!(op.invoked_at <= op.completed_at);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn copy_without_delete_loses_writes() {
    let outcome = run_scenario(scenario_config(RelocationMode::NonAtomicCopy, 60))
        .await
        .expect("scenario");
    assert_eq!(outcome.migration.keys_moved, 5);

    let violation = match outcome.check {
        Err(CheckError::ConsistencyViolation(violation)) => violation,
        other => panic!("expected a consistency violation, got {other:?}"),
    };
    assert!(outcome.final_lists.contains_key(&violation.key));

    let lost: usize = outcome
        .final_lists
        .iter()
        .map(|(key, values)| {
            acknowledged_appends(&outcome.history, key)
                .iter()
                .filter(|v| !values.contains(v))
                .count()
        })
        .sum();
    assert!(lost >= 5, "each key lost at least its mid-migration append, lost {lost}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_seed_appends_per_key_survive_migration() {
    let config = ScenarioConfig {
        initial_appends: 2,
        ..scenario_config(RelocationMode::Atomic, 60)
    };
    let outcome = run_scenario(config).await.expect("scenario");
    assert_eq!(outcome.migration.keys_moved, 5);
    if let Err(err) = &outcome.check {
        panic!("atomic migration must be linearizable: {err}");
    }

    assert_eq!(outcome.final_lists.len(), 5);
    for (key, values) in &outcome.final_lists {
        let acknowledged = acknowledged_appends(&outcome.history, key);
        assert!(acknowledged.len() >= 2, "{key} lost a seed append");
        assert_eq!(values.len(), acknowledged.len(), "lost appends on {key}");
        for value in &acknowledged {
            assert!(values.contains(value), "{key} is missing {value}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recorded_history_checks_the_same_after_reload() {
    let outcome = run_scenario(scenario_config(RelocationMode::Atomic, 80))
        .await
        .expect("scenario");
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("history.json");
    outcome.history.write_json(&path).expect("write");

    let reloaded = History::read_json(&path).expect("read");
    assert_eq!(reloaded, outcome.history);
    assert_eq!(reloaded.meta.seed, 42);
    assert_eq!(reloaded.meta.keys.len(), 5);
    LinearizabilityChecker::new(CheckerConfig::default())
        .check(&reloaded)
        .expect("linearizable after reload");
}
