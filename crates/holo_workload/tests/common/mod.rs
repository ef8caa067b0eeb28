//! Shared helpers for workload integration tests.

#![allow(dead_code)]

use std::time::Duration;

use holo_shard::migration::MigrationConfig;
use holo_workload::{tagged_keys, GeneratorConfig, History, OpKind, Outcome, RelocationMode, ScenarioConfig};

/// Small, seeded scenario over five `{test}` keys.
pub fn scenario_config(relocation: RelocationMode, ops: u64) -> ScenarioConfig {
    ScenarioConfig {
        generator: GeneratorConfig {
            processes: 5,
            keys: tagged_keys("test", 5),
            read_pct: 50,
            ops,
            duration: Duration::from_secs(20),
            seed: 42,
            ..GeneratorConfig::default()
        },
        migration: MigrationConfig {
            batch_size: 2,
            max_retries: 50,
            retry_backoff: Duration::from_millis(1),
        },
        initial_appends: 10,
        relocation,
        ..ScenarioConfig::default()
    }
}

/// Values of the appends on `key` that were acknowledged.
pub fn acknowledged_appends(history: &History, key: &str) -> Vec<String> {
    history
        .ops
        .iter()
        .filter(|op| op.key == key && op.kind == OpKind::Append)
        .filter(|op| matches!(op.outcome, Outcome::Appended { .. }))
        .filter_map(|op| op.value.clone())
        .collect()
}
