//! In-process replicated clusters.
//!
//! A [`LocalCluster`] runs a fixed set of [`Replica`]s behind one
//! [`ReplicatedLog`]. Every mutation (table REPLACE, writes, relocation steps)
//! is a logged command applied by every replica in order; reads run against
//! the leader in log order. Slot checks happen inside the applied command, so
//! a write racing a table flip is judged at its log position.
//!
//! Relocation is all-or-nothing per batch:
//! 1. source locks and exports the batch (`LockAndExport`), locked keys answer TRYAGAIN
//! 2. destination installs every exported entry in one command (`ImportKeys`, overwrite)
//! 3. source deletes and unlocks the batch (`DeleteAndUnlock`)
//!
//! If step 2 fails the source unlocks the keys and nothing is deleted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Redirect, RedirectKind, ShardError, ShardResult};
use crate::log::{decode_command, encode_command, ExecMeta, ReplicatedLog, StateMachine};
use crate::slot::{slot_of, Slot};
use crate::store::{ClusterInfo, ClusterStore, ScanPage, StoredValue};
use crate::table::{ClusterId, ShardGroupTable, ShardGroupTableStore, SlotOwner, SlotOwnership};

/// Configuration for one in-process cluster.
#[derive(Clone, Debug)]
pub struct LocalClusterConfig {
    pub cluster_id: ClusterId,
    /// Number of replicas applying the log.
    pub replicas: usize,
    /// Delay added before every request is served.
    pub op_latency: Duration,
}

impl LocalClusterConfig {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: ClusterId::new(cluster_id),
            replicas: 3,
            op_latency: Duration::ZERO,
        }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_op_latency(mut self, op_latency: Duration) -> Self {
        self.op_latency = op_latency;
        self
    }
}

/// Commands applied through a cluster's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ClusterCommand {
    ReplaceShardGroups {
        table: ShardGroupTable,
    },
    Set {
        key: Bytes,
        value: Bytes,
        asking: bool,
    },
    Append {
        key: Bytes,
        value: Bytes,
        asking: bool,
    },
    LockAndExport {
        destination: ClusterId,
        keys: Vec<Bytes>,
    },
    ImportKeys {
        entries: Vec<(Bytes, StoredValue)>,
    },
    DeleteAndUnlock {
        keys: Vec<Bytes>,
    },
    Unlock {
        keys: Vec<Bytes>,
    },
}

/// Successful command results.
#[derive(Debug)]
pub enum CommandReply {
    Ok,
    Length(u64),
    Exported(Vec<(Bytes, StoredValue)>),
}

#[derive(Debug)]
struct KvEntry {
    value: StoredValue,
    /// Insertion sequence; slot scans walk keys in this order.
    seq: u64,
}

#[derive(Debug, Default)]
struct KvState {
    entries: BTreeMap<Bytes, KvEntry>,
    by_seq: BTreeMap<u64, Bytes>,
    next_seq: u64,
    locked: BTreeSet<Bytes>,
}

impl KvState {
    fn insert(&mut self, key: Bytes, value: StoredValue) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.by_seq.insert(seq, key.clone());
        self.entries.insert(key, KvEntry { value, seq });
    }

    fn remove(&mut self, key: &[u8]) -> Option<StoredValue> {
        let entry = self.entries.remove(key)?;
        self.by_seq.remove(&entry.seq);
        Some(entry.value)
    }

    /// Examine at most `count` keys in insertion order starting at `cursor`,
    /// returning those that hash to `slot`.
    fn scan(&self, cursor: u64, slot: Slot, count: usize) -> ScanPage {
        let mut keys = Vec::new();
        let mut iter = self.by_seq.range(cursor.max(1)..);
        let mut last_seq = None;
        for (seq, key) in iter.by_ref().take(count.max(1)) {
            last_seq = Some(*seq);
            if slot_of(key) == slot {
                keys.push(key.clone());
            }
        }
        let next_cursor = match (last_seq, iter.next()) {
            (Some(last), Some(_)) => last + 1,
            _ => 0,
        };
        ScanPage { next_cursor, keys }
    }
}

fn wrong_type(key: &[u8]) -> ShardError {
    ShardError::ProtocolMisuse(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        String::from_utf8_lossy(key)
    ))
}

/// One replica of a local cluster.
pub struct Replica {
    cluster_id: ClusterId,
    node_id: String,
    table: ShardGroupTableStore,
    kv: RwLock<KvState>,
}

impl Replica {
    fn new(cluster_id: ClusterId, node_id: String) -> Self {
        Self {
            cluster_id,
            node_id,
            table: ShardGroupTableStore::new(),
            kv: RwLock::new(KvState::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn table(&self) -> &ShardGroupTableStore {
        &self.table
    }

    /// Raw value stored under `key`, bypassing slot checks.
    pub fn value(&self, key: &[u8]) -> Option<StoredValue> {
        self.kv.read().entries.get(key).map(|e| e.value.clone())
    }

    pub fn key_count(&self) -> usize {
        self.kv.read().entries.len()
    }

    /// Decide whether this cluster may serve `key` right now.
    fn check_route(&self, key: &[u8], asking: bool, kv: &KvState) -> ShardResult<()> {
        let slot = slot_of(key);
        let table = self.table.snapshot();
        let own = table
            .get(&self.cluster_id)
            .and_then(|entry| entry.ownership_of(slot));
        match own {
            Some(SlotOwnership::Stable) => Ok(()),
            Some(SlotOwnership::MigratingOut) => {
                if kv.locked.contains(key) {
                    return Err(ShardError::TransientUnavailable(format!(
                        "TRYAGAIN key in slot {slot} is being migrated"
                    )));
                }
                if kv.entries.contains_key(key) {
                    return Ok(());
                }
                match table.owner_of(slot) {
                    Some(SlotOwner::Migrating { to, .. }) => Err(ShardError::Redirect(Redirect {
                        kind: RedirectKind::Ask,
                        slot,
                        location: to.to_string(),
                    })),
                    _ => Err(ShardError::ProtocolMisuse(format!(
                        "slot {slot} is migrating out of {} without an importing cluster",
                        self.cluster_id
                    ))),
                }
            }
            Some(SlotOwnership::Importing) if asking => Ok(()),
            Some(SlotOwnership::Importing) | None => match table.owner_of(slot) {
                Some(owner) if *owner.serving() != self.cluster_id => {
                    Err(ShardError::Redirect(Redirect {
                        kind: RedirectKind::Moved,
                        slot,
                        location: owner.serving().to_string(),
                    }))
                }
                _ => Err(ShardError::TransientUnavailable(format!(
                    "CLUSTERDOWN hash slot {slot} is not served"
                ))),
            },
        }
    }

    fn check_migrating_to(&self, key: &[u8], destination: &ClusterId) -> ShardResult<()> {
        let slot = slot_of(key);
        let table = self.table.snapshot();
        match table.owner_of(slot) {
            Some(SlotOwner::Migrating { from, to })
                if from == self.cluster_id && to == *destination =>
            {
                Ok(())
            }
            _ => Err(ShardError::ProtocolMisuse(format!(
                "slot {slot} is not migrating from {} to {destination}",
                self.cluster_id
            ))),
        }
    }

    fn check_importable(&self, key: &[u8]) -> ShardResult<()> {
        let slot = slot_of(key);
        match self
            .table
            .get(&self.cluster_id)
            .and_then(|entry| entry.ownership_of(slot))
        {
            Some(SlotOwnership::Importing | SlotOwnership::Stable) => Ok(()),
            _ => Err(ShardError::ProtocolMisuse(format!(
                "cluster {} is not importing slot {slot}",
                self.cluster_id
            ))),
        }
    }

    fn apply_command(&self, cmd: ClusterCommand) -> ShardResult<CommandReply> {
        match cmd {
            ClusterCommand::ReplaceShardGroups { table } => {
                self.table.replace(table)?;
                Ok(CommandReply::Ok)
            }
            ClusterCommand::Set { key, value, asking } => {
                let mut kv = self.kv.write();
                self.check_route(&key, asking, &kv)?;
                kv.insert(key, StoredValue::String(value));
                Ok(CommandReply::Ok)
            }
            ClusterCommand::Append { key, value, asking } => {
                let mut kv = self.kv.write();
                self.check_route(&key, asking, &kv)?;
                let len = match kv.entries.get_mut(&key) {
                    Some(KvEntry {
                        value: StoredValue::List(items),
                        ..
                    }) => {
                        items.push(value);
                        items.len()
                    }
                    Some(_) => return Err(wrong_type(&key)),
                    None => {
                        kv.insert(key, StoredValue::List(vec![value]));
                        1
                    }
                };
                Ok(CommandReply::Length(len as u64))
            }
            ClusterCommand::LockAndExport { destination, keys } => {
                for key in &keys {
                    self.check_migrating_to(key, &destination)?;
                }
                let mut kv = self.kv.write();
                if let Some(key) = keys.iter().find(|k| kv.locked.contains(*k)) {
                    return Err(ShardError::TransientUnavailable(format!(
                        "TRYAGAIN key {} is locked by another relocation",
                        String::from_utf8_lossy(key)
                    )));
                }
                let mut exported = Vec::with_capacity(keys.len());
                for key in keys {
                    let Some(entry) = kv.entries.get(&key) else {
                        continue;
                    };
                    exported.push((key.clone(), entry.value.clone()));
                    kv.locked.insert(key);
                }
                Ok(CommandReply::Exported(exported))
            }
            ClusterCommand::ImportKeys { entries } => {
                for (key, _) in &entries {
                    self.check_importable(key)?;
                }
                let mut kv = self.kv.write();
                for (key, value) in entries {
                    kv.insert(key, value);
                }
                Ok(CommandReply::Ok)
            }
            ClusterCommand::DeleteAndUnlock { keys } => {
                let mut kv = self.kv.write();
                for key in &keys {
                    kv.remove(key);
                    kv.locked.remove(key);
                }
                Ok(CommandReply::Ok)
            }
            ClusterCommand::Unlock { keys } => {
                let mut kv = self.kv.write();
                for key in &keys {
                    kv.locked.remove(key);
                }
                Ok(CommandReply::Ok)
            }
        }
    }
}

impl StateMachine for Replica {
    type Output = ShardResult<CommandReply>;

    fn apply(&self, data: &[u8], meta: ExecMeta) -> Self::Output {
        match decode_command::<ClusterCommand>(data) {
            Ok(cmd) => self.apply_command(cmd),
            Err(err) => {
                tracing::error!(
                    cluster_id = %self.cluster_id,
                    node_id = %self.node_id,
                    index = meta.index,
                    error = ?err,
                    "cluster command decode failed"
                );
                Err(ShardError::ProtocolMisuse(format!(
                    "undecodable command at index {}",
                    meta.index
                )))
            }
        }
    }
}

/// Registry that lets local clusters reach each other by cluster id.
#[derive(Default)]
pub struct LocalNetwork {
    clusters: RwLock<BTreeMap<ClusterId, Weak<LocalCluster>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cluster(&self, cluster_id: &ClusterId) -> Option<Arc<LocalCluster>> {
        self.clusters.read().get(cluster_id).and_then(Weak::upgrade)
    }

    fn register(&self, cluster: &Arc<LocalCluster>) {
        self.clusters
            .write()
            .insert(cluster.cluster_id().clone(), Arc::downgrade(cluster));
    }
}

/// In-process cluster of replicas sharing one command log.
pub struct LocalCluster {
    config: LocalClusterConfig,
    log: ReplicatedLog<Replica>,
    network: Arc<LocalNetwork>,
    reachable: AtomicBool,
    fail_next: AtomicU32,
    lose_next_reply: AtomicBool,
}

impl LocalCluster {
    /// Create a cluster and register it on `network`.
    pub fn start(network: &Arc<LocalNetwork>, config: LocalClusterConfig) -> Arc<Self> {
        let replicas = (1..=config.replicas.max(1))
            .map(|idx| {
                Arc::new(Replica::new(
                    config.cluster_id.clone(),
                    format!("{}{idx:08}", config.cluster_id),
                ))
            })
            .collect::<Vec<_>>();
        let cluster = Arc::new(Self {
            log: ReplicatedLog::new(replicas),
            network: network.clone(),
            reachable: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            lose_next_reply: AtomicBool::new(false),
            config,
        });
        network.register(&cluster);
        tracing::debug!(
            cluster_id = %cluster.config.cluster_id,
            replicas = cluster.log.replicas().len(),
            "local cluster started"
        );
        cluster
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        self.log.replicas()
    }

    /// Value of `key` on the leader, bypassing slot checks.
    pub fn local_value(&self, key: &[u8]) -> Option<StoredValue> {
        self.log.query(|leader| leader.value(key))
    }

    /// Make every request fail with `TransientUnavailable` until re-enabled.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` requests with `TransientUnavailable`.
    pub fn fail_next_requests(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Apply the next successful mutation but report `Indeterminate`.
    pub fn lose_next_reply(&self) {
        self.lose_next_reply.store(true, Ordering::SeqCst);
    }

    /// Install entries exported by a relocating source.
    ///
    /// Overwrites existing keys, so replaying the same entries is a no-op.
    pub async fn import_keys(&self, entries: Vec<(Bytes, StoredValue)>) -> ShardResult<()> {
        self.admit().await?;
        let result = self
            .commit(&ClusterCommand::ImportKeys { entries })
            .map(|_| ());
        self.finish(result)
    }

    async fn admit(&self) -> ShardResult<()> {
        if !self.config.op_latency.is_zero() {
            tokio::time::sleep(self.config.op_latency).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ShardError::TransientUnavailable(format!(
                "cluster {} is unreachable",
                self.config.cluster_id
            )));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ShardError::TransientUnavailable(format!(
                "cluster {} dropped the request",
                self.config.cluster_id
            )));
        }
        Ok(())
    }

    fn commit(&self, cmd: &ClusterCommand) -> ShardResult<CommandReply> {
        let data = encode_command(cmd)
            .map_err(|err| ShardError::ProtocolMisuse(format!("encode command: {err}")))?;
        let (_, reply) = self.log.commit(data);
        reply
    }

    fn finish<T>(&self, result: ShardResult<T>) -> ShardResult<T> {
        if result.is_ok() && self.lose_next_reply.swap(false, Ordering::SeqCst) {
            return Err(ShardError::Indeterminate(format!(
                "reply from cluster {} lost after apply",
                self.config.cluster_id
            )));
        }
        result
    }

    fn unlock_after_failed_import(&self, keys: &[Bytes], err: ShardError) -> ShardError {
        if let Err(unlock_err) = self.commit(&ClusterCommand::Unlock {
            keys: keys.to_vec(),
        }) {
            tracing::error!(
                cluster_id = %self.config.cluster_id,
                error = %unlock_err,
                "failed to unlock keys after aborted relocation"
            );
        }
        match err {
            ShardError::ProtocolMisuse(_) => err,
            other => ShardError::TransientUnavailable(format!("relocation aborted: {other}")),
        }
    }
}

fn unexpected_reply(reply: CommandReply) -> ShardError {
    ShardError::ProtocolMisuse(format!("unexpected command reply {reply:?}"))
}

#[async_trait]
impl ClusterStore for LocalCluster {
    fn cluster_id(&self) -> &ClusterId {
        &self.config.cluster_id
    }

    async fn info(&self) -> ShardResult<ClusterInfo> {
        self.admit().await?;
        let keys = self.log.query(|leader| leader.key_count());
        let log_index = self.log.last_index();
        Ok(ClusterInfo {
            cluster_id: self.config.cluster_id.clone(),
            node_ids: self
                .replicas()
                .iter()
                .map(|r| r.node_id().to_string())
                .collect(),
            log_index,
            keys,
        })
    }

    async fn shard_groups(&self) -> ShardResult<ShardGroupTable> {
        self.admit().await?;
        Ok(self.log.query(|leader| (*leader.table().snapshot()).clone()))
    }

    async fn configure_shard_groups(&self, table: &ShardGroupTable) -> ShardResult<()> {
        self.admit().await?;
        self.log
            .query(|leader| leader.table().check_replace(table))?;
        let result = self
            .commit(&ClusterCommand::ReplaceShardGroups {
                table: table.clone(),
            })
            .map(|_| ());
        if result.is_ok() {
            tracing::info!(
                cluster_id = %self.config.cluster_id,
                groups = table.groups.len(),
                "shard group table replaced"
            );
        }
        self.finish(result)
    }

    async fn scan_slot(&self, cursor: u64, slot: Slot, count: usize) -> ShardResult<ScanPage> {
        self.admit().await?;
        Ok(self
            .log
            .query(|leader| leader.kv.read().scan(cursor, slot, count)))
    }

    async fn relocate_keys(&self, destination: &ClusterId, keys: &[Bytes]) -> ShardResult<usize> {
        self.admit().await?;
        if keys.is_empty() {
            return self.finish(Ok(0));
        }
        let exported = match self.commit(&ClusterCommand::LockAndExport {
            destination: destination.clone(),
            keys: keys.to_vec(),
        })? {
            CommandReply::Exported(entries) => entries,
            other => return Err(unexpected_reply(other)),
        };
        let moved = exported.len();

        if !exported.is_empty() {
            let imported = match self.network.cluster(destination) {
                Some(target) => target.import_keys(exported).await,
                None => Err(ShardError::TransientUnavailable(format!(
                    "cluster {destination} is not known to {}",
                    self.config.cluster_id
                ))),
            };
            if let Err(err) = imported {
                tracing::warn!(
                    source = %self.config.cluster_id,
                    destination = %destination,
                    keys = keys.len(),
                    error = %err,
                    "relocation batch aborted"
                );
                return Err(self.unlock_after_failed_import(keys, err));
            }
        }

        self.commit(&ClusterCommand::DeleteAndUnlock {
            keys: keys.to_vec(),
        })?;
        tracing::debug!(
            source = %self.config.cluster_id,
            destination = %destination,
            moved,
            "relocated key batch"
        );
        self.finish(Ok(moved))
    }

    async fn get(&self, key: &[u8], asking: bool) -> ShardResult<Option<Bytes>> {
        self.admit().await?;
        self.log.query(|leader| {
            let kv = leader.kv.read();
            leader.check_route(key, asking, &kv)?;
            match kv.entries.get(key).map(|e| &e.value) {
                None => Ok(None),
                Some(StoredValue::String(value)) => Ok(Some(value.clone())),
                Some(StoredValue::List(_)) => Err(wrong_type(key)),
            }
        })
    }

    async fn set(&self, key: &[u8], value: Bytes, asking: bool) -> ShardResult<()> {
        self.admit().await?;
        let result = self
            .commit(&ClusterCommand::Set {
                key: Bytes::copy_from_slice(key),
                value,
                asking,
            })
            .map(|_| ());
        self.finish(result)
    }

    async fn append(&self, key: &[u8], value: Bytes, asking: bool) -> ShardResult<u64> {
        self.admit().await?;
        let result = match self.commit(&ClusterCommand::Append {
            key: Bytes::copy_from_slice(key),
            value,
            asking,
        })? {
            CommandReply::Length(len) => Ok(len),
            other => Err(unexpected_reply(other)),
        };
        self.finish(result)
    }

    async fn read_list(&self, key: &[u8], asking: bool) -> ShardResult<Vec<Bytes>> {
        self.admit().await?;
        self.log.query(|leader| {
            let kv = leader.kv.read();
            leader.check_route(key, asking, &kv)?;
            match kv.entries.get(key).map(|e| &e.value) {
                None => Ok(Vec::new()),
                Some(StoredValue::List(items)) => Ok(items.clone()),
                Some(StoredValue::String(_)) => Err(wrong_type(key)),
            }
        })
    }
}
