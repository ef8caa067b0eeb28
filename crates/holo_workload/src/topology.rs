//! Client-side routing view across clusters.
//!
//! Every cluster only vouches for its own committed table, and during a
//! reconfiguration the clusters disagree. The view keeps, per cluster id, the
//! newest entry (highest term) reported by any cluster and resolves owners
//! from that merged table.

use std::collections::BTreeMap;
use std::sync::Arc;

use holo_shard::{slot_of, ClusterId, ClusterStore, ShardGroupEntry, ShardGroupTable, ShardResult};
use parking_lot::RwLock;

pub struct Topology {
    clusters: BTreeMap<ClusterId, Arc<dyn ClusterStore>>,
    view: RwLock<ShardGroupTable>,
}

impl Topology {
    pub fn new(clusters: impl IntoIterator<Item = Arc<dyn ClusterStore>>) -> Self {
        let clusters = clusters
            .into_iter()
            .map(|cluster| (cluster.cluster_id().clone(), cluster))
            .collect();
        Self {
            clusters,
            view: RwLock::new(ShardGroupTable::new()),
        }
    }

    pub fn cluster(&self, cluster_id: &ClusterId) -> Option<Arc<dyn ClusterStore>> {
        self.clusters.get(cluster_id).cloned()
    }

    pub fn view(&self) -> ShardGroupTable {
        self.view.read().clone()
    }

    /// Re-read every cluster's table and merge it into the view.
    ///
    /// Clusters that cannot be reached are skipped; fails only if none could.
    pub async fn refresh(&self) -> ShardResult<()> {
        let mut fetched = Vec::with_capacity(self.clusters.len());
        let mut last_err = None;
        for (cluster_id, cluster) in &self.clusters {
            match cluster.shard_groups().await {
                Ok(table) => fetched.push(table),
                Err(err) => {
                    tracing::debug!(cluster_id = %cluster_id, error = %err, "table refresh failed");
                    last_err = Some(err);
                }
            }
        }
        if fetched.is_empty() {
            if let Some(err) = last_err {
                return Err(err);
            }
        }
        let mut view = self.view.write();
        for table in fetched {
            merge(&mut view, table);
        }
        Ok(())
    }

    /// Cluster that serves `key` without ASKING, per the current view.
    pub fn route(&self, key: &[u8]) -> Option<Arc<dyn ClusterStore>> {
        let owner = self.view.read().owner_of(slot_of(key))?;
        self.cluster(owner.serving())
    }

    /// Resolve a redirect location: a cluster id or a replica address.
    pub fn resolve(&self, location: &str) -> Option<Arc<dyn ClusterStore>> {
        if let Some(cluster) = self.clusters.get(&ClusterId::new(location)) {
            return Some(cluster.clone());
        }
        let view = self.view.read();
        let cluster_id = view.cluster_for_address(location)?;
        self.cluster(cluster_id)
    }
}

fn merge(view: &mut ShardGroupTable, table: ShardGroupTable) {
    for (cluster_id, entry) in table.groups {
        let newer = view
            .groups
            .get(&cluster_id)
            .map_or(true, |known: &ShardGroupEntry| entry.term() > known.term());
        if newer {
            view.groups.insert(cluster_id, entry);
        }
    }
}
