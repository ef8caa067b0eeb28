//! Command surface consumed from a cluster.
//!
//! Implemented by [`crate::local::LocalCluster`] (in-process replicas) and
//! [`crate::resp::RespCluster`] (RESP2 over TCP).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ShardResult;
use crate::slot::Slot;
use crate::table::{ClusterId, ShardGroupTable};

/// One page of a slot scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` means the slot is exhausted.
    pub next_cursor: u64,
    /// May be empty while `next_cursor` is non-zero (sparse slot).
    pub keys: Vec<Bytes>,
}

/// Subset of `INFO` used to correlate clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: ClusterId,
    pub node_ids: Vec<String>,
    pub log_index: u64,
    pub keys: usize,
}

/// Value stored under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    String(Bytes),
    List(Vec<Bytes>),
}

/// Commands a cluster exposes to the coordinator and the workload.
///
/// Key commands take `asking` to model the ASKING prefix that lets an
/// importing cluster serve a key during migration.
#[async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    /// Identifier reported by `INFO`.
    fn cluster_id(&self) -> &ClusterId;

    async fn info(&self) -> ShardResult<ClusterInfo>;

    /// The cluster's committed shard-group table.
    async fn shard_groups(&self) -> ShardResult<ShardGroupTable>;

    /// REPLACE the full table through the cluster's log.
    async fn configure_shard_groups(&self, table: &ShardGroupTable) -> ShardResult<()>;

    async fn scan_slot(&self, cursor: u64, slot: Slot, count: usize) -> ShardResult<ScanPage>;

    /// Atomically move `keys` to `destination` and delete them locally.
    /// Returns the number of keys moved.
    async fn relocate_keys(&self, destination: &ClusterId, keys: &[Bytes]) -> ShardResult<usize>;

    async fn get(&self, key: &[u8], asking: bool) -> ShardResult<Option<Bytes>>;

    async fn set(&self, key: &[u8], value: Bytes, asking: bool) -> ShardResult<()>;

    /// Append to the list at `key`, returning the new length.
    async fn append(&self, key: &[u8], value: Bytes, asking: bool) -> ShardResult<u64>;

    /// Whole list at `key`; empty when the key does not exist.
    async fn read_list(&self, key: &[u8], asking: bool) -> ShardResult<Vec<Bytes>>;
}
