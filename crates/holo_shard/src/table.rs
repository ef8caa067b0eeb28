//! Shard-group ownership tables.
//!
//! A [`ShardGroupTable`] is the full picture of which cluster owns which hash
//! slots. Each cluster replicates its own copy through its command log and only
//! ever swaps it whole (REPLACE), never patches it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};
use crate::slot::{Slot, MAX_SLOT, SLOT_COUNT};

/// Opaque cluster identifier (RedisRaft `raft_dbid`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Ownership state of a slot range inside one entry.
///
/// `MigratingOut` and `Importing` only ever appear as a pair across two
/// entries while the range is being moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotOwnership {
    Stable,
    MigratingOut,
    Importing,
}

impl SlotOwnership {
    /// Wire code used by `RAFT.SHARDGROUP` (1 stable, 2 importing, 3 migrating).
    pub fn code(self) -> u8 {
        match self {
            SlotOwnership::Stable => 1,
            SlotOwnership::Importing => 2,
            SlotOwnership::MigratingOut => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SlotOwnership::Stable),
            2 => Some(SlotOwnership::Importing),
            3 => Some(SlotOwnership::MigratingOut),
            _ => None,
        }
    }
}

/// Inclusive slot range `[start, end]` with its ownership state and term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: Slot,
    pub end: Slot,
    pub ownership: SlotOwnership,
    pub term: u64,
}

impl SlotRange {
    pub fn new(start: Slot, end: Slot, ownership: SlotOwnership, term: u64) -> Self {
        Self {
            start,
            end,
            ownership,
            term,
        }
    }

    pub fn stable(start: Slot, end: Slot, term: u64) -> Self {
        Self::new(start, end, SlotOwnership::Stable, term)
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.start <= slot && slot <= self.end
    }

    pub fn overlaps(&self, start: Slot, end: Slot) -> bool {
        self.start <= end && start <= self.end
    }
}

/// One replica of a shard group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
    pub node_id: String,
    pub address: String,
}

/// Ownership record of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupEntry {
    pub cluster_id: ClusterId,
    /// Ordered by `start`; ranges never overlap within one entry.
    pub slot_ranges: Vec<SlotRange>,
    pub replica_endpoints: Vec<ReplicaEndpoint>,
    /// Relative priority among entries sharing a transitional range.
    pub weight: u32,
}

impl ShardGroupEntry {
    pub fn new(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id,
            slot_ranges: Vec::new(),
            replica_endpoints: Vec::new(),
            weight: 1,
        }
    }

    pub fn with_range(mut self, range: SlotRange) -> Self {
        self.slot_ranges.push(range);
        self.slot_ranges.sort_by_key(|r| r.start);
        self
    }

    pub fn with_replica(mut self, node_id: impl Into<String>, address: impl Into<String>) -> Self {
        self.replica_endpoints.push(ReplicaEndpoint {
            node_id: node_id.into(),
            address: address.into(),
        });
        self
    }

    /// Highest term carried by any of this entry's ranges.
    pub fn term(&self) -> u64 {
        self.slot_ranges.iter().map(|r| r.term).max().unwrap_or(0)
    }

    /// The range of this entry covering `slot`, if any.
    pub fn range_for(&self, slot: Slot) -> Option<&SlotRange> {
        self.slot_ranges.iter().find(|r| r.contains(slot))
    }

    pub fn ownership_of(&self, slot: Slot) -> Option<SlotOwnership> {
        self.range_for(slot).map(|r| r.ownership)
    }

    /// Whether `address` names one of this entry's replicas.
    pub fn has_endpoint(&self, address: &str) -> bool {
        self.replica_endpoints.iter().any(|r| r.address == address)
    }
}

/// Resolved owner of a single slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOwner {
    Stable(ClusterId),
    Migrating { from: ClusterId, to: ClusterId },
}

impl SlotOwner {
    /// Cluster that serves requests without ASKING.
    pub fn serving(&self) -> &ClusterId {
        match self {
            SlotOwner::Stable(id) => id,
            SlotOwner::Migrating { from, .. } => from,
        }
    }
}

/// Full ownership table: every shard group of one logical keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupTable {
    pub groups: BTreeMap<ClusterId, ShardGroupEntry>,
}

impl ShardGroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ShardGroupEntry>) -> Self {
        let groups = entries
            .into_iter()
            .map(|entry| (entry.cluster_id.clone(), entry))
            .collect();
        Self { groups }
    }

    pub fn get(&self, cluster_id: &ClusterId) -> Option<&ShardGroupEntry> {
        self.groups.get(cluster_id)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Resolve the owner of `slot`, tolerating tables that are not fully
    /// validated (routing views merged from several clusters).
    ///
    /// When several entries claim the slot, the claim with the highest term
    /// wins; ties prefer the serving side over the importing side.
    pub fn owner_of(&self, slot: Slot) -> Option<SlotOwner> {
        let mut serving: Option<(&ClusterId, u64)> = None;
        let mut importing: Option<(&ClusterId, u64)> = None;
        for entry in self.groups.values() {
            let Some(range) = entry.range_for(slot) else {
                continue;
            };
            let slot_claim = match range.ownership {
                SlotOwnership::Stable | SlotOwnership::MigratingOut => &mut serving,
                SlotOwnership::Importing => &mut importing,
            };
            if slot_claim.map_or(true, |(_, term)| range.term > term) {
                *slot_claim = Some((&entry.cluster_id, range.term));
            }
        }
        match (serving, importing) {
            (Some((from, from_term)), Some((to, to_term))) => {
                let from_entry = self.groups.get(from)?;
                let migrating =
                    from_entry.ownership_of(slot) == Some(SlotOwnership::MigratingOut);
                // An importing claim at least as new as a stable one means the
                // source has not applied the migration yet; it still serves.
                if migrating || to_term >= from_term {
                    Some(SlotOwner::Migrating {
                        from: from.clone(),
                        to: to.clone(),
                    })
                } else {
                    Some(SlotOwner::Stable(from.clone()))
                }
            }
            (Some((from, _)), None) => Some(SlotOwner::Stable(from.clone())),
            (None, Some((to, _))) => Some(SlotOwner::Stable(to.clone())),
            (None, None) => None,
        }
    }

    /// Find the cluster that lists `address` as a replica endpoint.
    pub fn cluster_for_address(&self, address: &str) -> Option<&ClusterId> {
        self.groups
            .values()
            .find(|entry| entry.has_endpoint(address))
            .map(|entry| &entry.cluster_id)
    }

    /// Check structural validity of a full table.
    ///
    /// Every slot must be claimed by exactly one stable owner, or by exactly
    /// one migrating-out entry plus one importing entry.
    pub fn validate(&self) -> ShardResult<()> {
        let slots = usize::from(SLOT_COUNT);
        let mut stable = vec![0u8; slots];
        let mut migrating = vec![0u8; slots];
        let mut importing = vec![0u8; slots];

        for (key, entry) in &self.groups {
            if *key != entry.cluster_id {
                return Err(ShardError::ProtocolMisuse(format!(
                    "table key {key} does not match entry cluster id {}",
                    entry.cluster_id
                )));
            }
            let mut prev_end: Option<Slot> = None;
            for range in &entry.slot_ranges {
                if range.start > range.end || range.end > MAX_SLOT {
                    return Err(ShardError::ProtocolMisuse(format!(
                        "cluster {key} has invalid slot range {}-{}",
                        range.start, range.end
                    )));
                }
                if prev_end.is_some_and(|end| range.start <= end) {
                    return Err(ShardError::ProtocolMisuse(format!(
                        "cluster {key} has overlapping or unordered range starting at {}",
                        range.start
                    )));
                }
                prev_end = Some(range.end);

                let counts = match range.ownership {
                    SlotOwnership::Stable => &mut stable,
                    SlotOwnership::MigratingOut => &mut migrating,
                    SlotOwnership::Importing => &mut importing,
                };
                for slot in range.start..=range.end {
                    let count = &mut counts[usize::from(slot)];
                    *count = count.saturating_add(1);
                }
            }
        }

        for slot in 0..slots {
            let claims = (stable[slot], migrating[slot], importing[slot]);
            if !matches!(claims, (1, 0, 0) | (0, 1, 1)) {
                return Err(ShardError::ProtocolMisuse(format!(
                    "slot {slot} has {} stable, {} migrating-out and {} importing claims",
                    claims.0, claims.1, claims.2
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TableState {
    table: Arc<ShardGroupTable>,
    /// Highest term ever committed per cluster; survives entries that later
    /// own no ranges or disappear from the table.
    term_floor: BTreeMap<ClusterId, u64>,
    version: u64,
}

/// One replica's committed shard-group table.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct ShardGroupTableStore {
    state: Arc<RwLock<TableState>>,
}

impl ShardGroupTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current committed table.
    pub fn snapshot(&self) -> Arc<ShardGroupTable> {
        self.state.read().table.clone()
    }

    pub fn get(&self, cluster_id: &ClusterId) -> Option<ShardGroupEntry> {
        self.state.read().table.get(cluster_id).cloned()
    }

    /// Number of committed REPLACE commands.
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn stored_term(&self, cluster_id: &ClusterId) -> u64 {
        self.state
            .read()
            .term_floor
            .get(cluster_id)
            .copied()
            .unwrap_or(0)
    }

    /// Validate `table` against the committed state without applying it.
    pub fn check_replace(&self, table: &ShardGroupTable) -> ShardResult<()> {
        table.validate()?;
        check_terms(&self.state.read(), table)
    }

    /// Swap in `table` if it is valid and no term is stale.
    ///
    /// Returns the new table version. On error nothing changes.
    pub fn replace(&self, table: ShardGroupTable) -> ShardResult<u64> {
        table.validate()?;
        let mut state = self.state.write();
        check_terms(&state, &table)?;
        for entry in table.groups.values() {
            let floor = state.term_floor.entry(entry.cluster_id.clone()).or_insert(0);
            *floor = (*floor).max(entry.term());
        }
        state.table = Arc::new(table);
        state.version += 1;
        Ok(state.version)
    }
}

fn check_terms(state: &TableState, table: &ShardGroupTable) -> ShardResult<()> {
    for entry in table.groups.values() {
        let Some(&stored_term) = state.term_floor.get(&entry.cluster_id) else {
            continue;
        };
        if let Some(stale) = entry.slot_ranges.iter().find(|r| r.term < stored_term) {
            return Err(ShardError::ConfigConflict {
                cluster_id: entry.cluster_id.clone(),
                stored_term,
                offered_term: stale.term,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(id: &str) -> ClusterId {
        ClusterId::new(id)
    }

    fn single_owner(term: u64) -> ShardGroupTable {
        ShardGroupTable::from_entries([
            ShardGroupEntry::new(c("c1")).with_range(SlotRange::stable(0, MAX_SLOT, term))
        ])
    }

    fn migrating(slot: Slot, term: u64) -> ShardGroupTable {
        ShardGroupTable::from_entries([
            ShardGroupEntry::new(c("c1"))
                .with_range(SlotRange::stable(0, slot - 1, term))
                .with_range(SlotRange::new(slot, slot, SlotOwnership::MigratingOut, term))
                .with_range(SlotRange::stable(slot + 1, MAX_SLOT, term)),
            ShardGroupEntry::new(c("c2"))
                .with_range(SlotRange::new(slot, slot, SlotOwnership::Importing, term)),
        ])
    }

    #[test]
    fn validate_accepts_stable_and_migrating_layouts() {
        single_owner(1).validate().unwrap();
        migrating(6918, 2).validate().unwrap();
    }

    #[test]
    fn validate_rejects_gap() {
        let table = ShardGroupTable::from_entries([
            ShardGroupEntry::new(c("c1")).with_range(SlotRange::stable(0, 99, 1))
        ]);
        let err = table.validate().unwrap_err();
        assert!(matches!(err, ShardError::ProtocolMisuse(ref msg) if msg.contains("slot 100")));
    }

    #[test]
    fn validate_rejects_double_stable_owner() {
        let table = ShardGroupTable::from_entries([
            ShardGroupEntry::new(c("c1")).with_range(SlotRange::stable(0, MAX_SLOT, 1)),
            ShardGroupEntry::new(c("c2")).with_range(SlotRange::stable(10, 10, 1)),
        ]);
        assert!(matches!(
            table.validate(),
            Err(ShardError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn validate_rejects_unpaired_migration() {
        let mut table = migrating(42, 1);
        table.groups.remove(&c("c2"));
        assert!(matches!(
            table.validate(),
            Err(ShardError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn validate_rejects_overlap_within_entry() {
        let mut entry = ShardGroupEntry::new(c("c1"));
        entry.slot_ranges = vec![SlotRange::stable(0, 100, 1), SlotRange::stable(50, MAX_SLOT, 1)];
        let table = ShardGroupTable::from_entries([entry]);
        assert!(matches!(
            table.validate(),
            Err(ShardError::ProtocolMisuse(ref msg)) if msg.contains("overlapping")
        ));
    }

    #[test]
    fn validate_rejects_out_of_bounds_range() {
        let table = ShardGroupTable::from_entries([
            ShardGroupEntry::new(c("c1")).with_range(SlotRange::stable(0, SLOT_COUNT, 1))
        ]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn owner_of_resolves_stable_and_migrating() {
        let table = migrating(6918, 2);
        assert_eq!(table.owner_of(0), Some(SlotOwner::Stable(c("c1"))));
        assert_eq!(
            table.owner_of(6918),
            Some(SlotOwner::Migrating {
                from: c("c1"),
                to: c("c2")
            })
        );
        assert_eq!(table.owner_of(6918).unwrap().serving(), &c("c1"));
    }

    #[test]
    fn owner_of_prefers_newer_claim_in_merged_views() {
        // c1 still believes it owns everything at term 1; c2 finished the
        // migration at term 3.
        let table = ShardGroupTable::from_entries([
            ShardGroupEntry::new(c("c1")).with_range(SlotRange::stable(0, MAX_SLOT, 1)),
            ShardGroupEntry::new(c("c2")).with_range(SlotRange::stable(7, 7, 3)),
        ]);
        assert_eq!(table.owner_of(7), Some(SlotOwner::Stable(c("c2"))));
        assert_eq!(table.owner_of(8), Some(SlotOwner::Stable(c("c1"))));
    }

    #[test]
    fn replace_swaps_whole_table_and_bumps_version() {
        let store = ShardGroupTableStore::new();
        assert_eq!(store.replace(single_owner(1)).unwrap(), 1);
        assert_eq!(store.replace(migrating(5, 2)).unwrap(), 2);
        assert_eq!(*store.snapshot(), migrating(5, 2));
        assert_eq!(store.stored_term(&c("c1")), 2);
        assert_eq!(
            store.get(&c("c2")).unwrap().ownership_of(5),
            Some(SlotOwnership::Importing)
        );
    }

    #[test]
    fn stale_term_is_rejected_without_mutation() {
        let store = ShardGroupTableStore::new();
        store.replace(migrating(5, 3)).unwrap();
        let before = store.snapshot();

        let err = store.replace(single_owner(2)).unwrap_err();
        assert_eq!(
            err,
            ShardError::ConfigConflict {
                cluster_id: c("c1"),
                stored_term: 3,
                offered_term: 2,
            }
        );
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.version(), 1);
        assert_eq!(store.stored_term(&c("c1")), 3);
    }

    #[test]
    fn equal_term_is_accepted() {
        let store = ShardGroupTableStore::new();
        store.replace(single_owner(4)).unwrap();
        store.replace(single_owner(4)).unwrap();
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn invalid_table_is_rejected_without_mutation() {
        let store = ShardGroupTableStore::new();
        store.replace(single_owner(1)).unwrap();
        let mut broken = migrating(5, 2);
        broken.groups.remove(&c("c2"));
        assert!(matches!(
            store.replace(broken),
            Err(ShardError::ProtocolMisuse(_))
        ));
        assert_eq!(*store.snapshot(), single_owner(1));
    }

    #[test]
    fn term_floor_survives_entry_removal() {
        let store = ShardGroupTableStore::new();
        store.replace(migrating(5, 3)).unwrap();
        // c2 drops out of the table entirely.
        store.replace(single_owner(3)).unwrap();
        assert_eq!(store.stored_term(&c("c2")), 3);
        let stale = ShardGroupTable::from_entries([
            ShardGroupEntry::new(c("c1"))
                .with_range(SlotRange::stable(0, 4, 3))
                .with_range(SlotRange::stable(6, MAX_SLOT, 3)),
            ShardGroupEntry::new(c("c2")).with_range(SlotRange::stable(5, 5, 1)),
        ]);
        assert!(matches!(
            store.replace(stale),
            Err(ShardError::ConfigConflict { .. })
        ));
    }

    #[test]
    fn ownership_codes_round_trip_wire_values() {
        for ownership in [
            SlotOwnership::Stable,
            SlotOwnership::MigratingOut,
            SlotOwnership::Importing,
        ] {
            assert_eq!(SlotOwnership::from_code(ownership.code()), Some(ownership));
        }
        assert_eq!(SlotOwnership::from_code(0), None);
    }
}
