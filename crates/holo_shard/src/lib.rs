//! Shard-group ownership and slot migration across replicated clusters.
//!
//! Keys hash to one of 16384 slots ([`slot`]). Each cluster keeps a full
//! [`table::ShardGroupTable`] saying which cluster owns which slots, replicated
//! through its own command log and replaced whole. Moving a slot range is:
//! 1. [`operator::begin_migration`] + [`operator::reconfigure`] on both clusters
//! 2. [`migration::MigrationCoordinator`] drains the keys
//! 3. [`operator::finish_migration`] + [`operator::reconfigure`]
//!
//! Clusters are reached through the [`store::ClusterStore`] trait, implemented
//! in-process by [`local::LocalCluster`] and over RESP2 by [`resp::RespCluster`].

pub mod error;
pub mod local;
pub mod log;
pub mod migration;
pub mod operator;
pub mod resp;
pub mod slot;
pub mod store;
pub mod table;

pub use error::{Redirect, RedirectKind, ShardError, ShardResult};
pub use slot::{hash_tag, slot_of, Slot, MAX_SLOT, SLOT_COUNT};
pub use store::{ClusterInfo, ClusterStore, ScanPage, StoredValue};
pub use table::{
    ClusterId, ReplicaEndpoint, ShardGroupEntry, ShardGroupTable, ShardGroupTableStore, SlotOwner,
    SlotOwnership, SlotRange,
};
