//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use holo_shard::local::{LocalCluster, LocalClusterConfig, LocalNetwork};
use holo_shard::migration::{MigrationConfig, MigrationCoordinator};
use holo_shard::operator::{begin_migration, finish_migration, reconfigure};
use holo_shard::{ClusterId, ClusterStore, ShardGroupEntry, ShardGroupTable, Slot, SlotRange, MAX_SLOT};

/// Two 3-replica clusters on one in-process network, with `c1` owning every
/// slot.
pub struct TwoClusters {
    pub network: Arc<LocalNetwork>,
    pub c1: Arc<LocalCluster>,
    pub c2: Arc<LocalCluster>,
    pub table: ShardGroupTable,
}

impl TwoClusters {
    pub fn id1(&self) -> ClusterId {
        ClusterId::new("c1")
    }

    pub fn id2(&self) -> ClusterId {
        ClusterId::new("c2")
    }

    pub fn stores(&self) -> Vec<Arc<dyn ClusterStore>> {
        vec![self.c1.clone(), self.c2.clone()]
    }

    /// REPLACE "begin migration of `slot` from c1 to c2" on both clusters.
    pub async fn begin(&mut self, slot: Slot) -> anyhow::Result<()> {
        let next = begin_migration(&self.table, &self.id1(), &self.id2(), slot, slot)?;
        self.table = reconfigure(&self.stores(), &next).await?;
        Ok(())
    }

    /// REPLACE "finish migration of `slot`" on both clusters.
    pub async fn finish(&mut self, slot: Slot) -> anyhow::Result<()> {
        let next = finish_migration(&self.table, &self.id1(), &self.id2(), slot, slot)?;
        self.table = reconfigure(&self.stores(), &next).await?;
        Ok(())
    }

    pub fn coordinator(&self) -> MigrationCoordinator {
        MigrationCoordinator::new(self.c1.clone(), self.id2(), migration_config())
    }
}

pub fn migration_config() -> MigrationConfig {
    MigrationConfig {
        batch_size: 2,
        max_retries: 20,
        retry_backoff: Duration::from_millis(1),
    }
}

fn entry(id: &str) -> ShardGroupEntry {
    (1..=3).fold(ShardGroupEntry::new(ClusterId::new(id)), |entry, idx| {
        entry.with_replica(format!("{id}{idx:08}"), format!("local://{id}/{idx}"))
    })
}

/// Start both clusters and install the initial table on each.
pub async fn two_clusters() -> anyhow::Result<TwoClusters> {
    let network = LocalNetwork::new();
    let c1 = LocalCluster::start(&network, LocalClusterConfig::new("c1"));
    let c2 = LocalCluster::start(&network, LocalClusterConfig::new("c2"));
    let table = ShardGroupTable::from_entries([
        entry("c1").with_range(SlotRange::stable(0, MAX_SLOT, 1)),
        entry("c2"),
    ]);
    let stores: Vec<Arc<dyn ClusterStore>> = vec![c1.clone(), c2.clone()];
    let table = reconfigure(&stores, &table)
        .await
        .context("install initial table")?;
    Ok(TwoClusters {
        network,
        c1,
        c2,
        table,
    })
}

pub fn key(name: &str) -> Bytes {
    Bytes::from(name.to_string())
}
