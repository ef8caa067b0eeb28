//! Linearizability harness for slot migration.
//!
//! A set of processes issues list appends and reads against clusters reached
//! through [`holo_shard::ClusterStore`], following MOVED/ASK redirects while a
//! slot moves. Every operation is recorded into a [`history::History`], which
//! [`checker::LinearizabilityChecker`] then verifies per key.

pub mod checker;
pub mod generator;
pub mod history;
pub mod scenario;
pub mod topology;

pub use checker::{CheckError, CheckReport, CheckerConfig, LinearizabilityChecker, Violation};
pub use generator::{tagged_keys, GeneratorConfig, GeneratorStats, OperationGenerator};
pub use history::{History, HistoryMeta, HistoryRecorder, OpKind, Operation, Outcome};
pub use scenario::{run_scenario, RelocationMode, ScenarioConfig, ScenarioOutcome};
pub use topology::Topology;
