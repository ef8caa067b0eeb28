//! Operator-side table construction and distribution.
//!
//! Tables are rebuilt whole from the previous table; every range of the two
//! clusters involved is re-stamped with a term one above the highest either
//! of them carried, so each REPLACE strictly supersedes the last.

use std::sync::Arc;

use crate::error::{ShardError, ShardResult};
use crate::slot::Slot;
use crate::store::ClusterStore;
use crate::table::{ClusterId, ShardGroupEntry, ShardGroupTable, SlotOwnership, SlotRange};

/// Attempts per cluster before a repeated term conflict is returned.
const MAX_CONFLICT_RETRIES: usize = 8;

/// Mark `start..=end` migrating out of `from` and importing into `to`.
///
/// Every slot of the range must currently be stable on `from`.
pub fn begin_migration(
    table: &ShardGroupTable,
    from: &ClusterId,
    to: &ClusterId,
    start: Slot,
    end: Slot,
) -> ShardResult<ShardGroupTable> {
    let (source, dest) = entries(table, from, to, start, end)?;
    require_coverage(source, start, end, SlotOwnership::Stable)?;

    let term = source.term().max(dest.term()) + 1;
    let mut next = table.clone();
    let source_ranges = split(&source.slot_ranges, start, end, |r| {
        Some(SlotRange::new(r.start, r.end, SlotOwnership::MigratingOut, r.term))
    });
    let mut dest_ranges = dest.slot_ranges.clone();
    dest_ranges.push(SlotRange::new(start, end, SlotOwnership::Importing, term));
    install(&mut next, from, source_ranges, term);
    install(&mut next, to, dest_ranges, term);
    next.validate()?;
    Ok(next)
}

/// Make `to` the stable owner of `start..=end` and drop it from `from`.
///
/// The range must be migrating out of `from` and importing into `to`.
pub fn finish_migration(
    table: &ShardGroupTable,
    from: &ClusterId,
    to: &ClusterId,
    start: Slot,
    end: Slot,
) -> ShardResult<ShardGroupTable> {
    let (source, dest) = entries(table, from, to, start, end)?;
    require_coverage(source, start, end, SlotOwnership::MigratingOut)?;
    require_coverage(dest, start, end, SlotOwnership::Importing)?;

    let term = source.term().max(dest.term()) + 1;
    let mut next = table.clone();
    let source_ranges = split(&source.slot_ranges, start, end, |_| None);
    let dest_ranges = split(&dest.slot_ranges, start, end, |r| {
        Some(SlotRange::stable(r.start, r.end, r.term))
    });
    install(&mut next, from, source_ranges, term);
    install(&mut next, to, dest_ranges, term);
    next.validate()?;
    Ok(next)
}

/// REPLACE `table` on every cluster in order.
///
/// A `ConfigConflict` re-reads the cluster's stored table, raises the
/// offending terms to the stored floor and retries; later clusters receive
/// the corrected table. A conflict that raising leaves unchanged is returned
/// at once. Returns the table that was finally installed.
pub async fn reconfigure(
    clusters: &[Arc<dyn ClusterStore>],
    table: &ShardGroupTable,
) -> ShardResult<ShardGroupTable> {
    let mut table = table.clone();
    for cluster in clusters {
        let mut attempts = 0;
        loop {
            match cluster.configure_shard_groups(&table).await {
                Ok(()) => break,
                Err(ShardError::ConfigConflict {
                    cluster_id,
                    stored_term,
                    offered_term,
                }) if attempts < MAX_CONFLICT_RETRIES => {
                    attempts += 1;
                    tracing::warn!(
                        target_cluster = %cluster.cluster_id(),
                        conflicting = %cluster_id,
                        stored_term,
                        offered_term,
                        attempt = attempts,
                        "shard group table rejected, raising terms"
                    );
                    let stored = cluster.shard_groups().await?;
                    if !raise_terms(&mut table, &stored, &cluster_id, stored_term) {
                        return Err(ShardError::ConfigConflict {
                            cluster_id,
                            stored_term,
                            offered_term,
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }
        tracing::info!(
            cluster_id = %cluster.cluster_id(),
            groups = table.groups.len(),
            "reconfigured cluster"
        );
    }
    Ok(table)
}

/// Returns whether any term was raised.
fn raise_terms(
    table: &mut ShardGroupTable,
    stored: &ShardGroupTable,
    conflicting: &ClusterId,
    stored_term: u64,
) -> bool {
    let mut raised = false;
    for entry in table.groups.values_mut() {
        let mut floor = stored.get(&entry.cluster_id).map_or(0, ShardGroupEntry::term);
        if entry.cluster_id == *conflicting {
            floor = floor.max(stored_term);
        }
        for range in entry.slot_ranges.iter_mut().filter(|range| range.term < floor) {
            range.term = floor;
            raised = true;
        }
    }
    raised
}

fn entries<'a>(
    table: &'a ShardGroupTable,
    from: &ClusterId,
    to: &ClusterId,
    start: Slot,
    end: Slot,
) -> ShardResult<(&'a ShardGroupEntry, &'a ShardGroupEntry)> {
    if from == to {
        return Err(ShardError::ProtocolMisuse(format!(
            "cannot migrate cluster {from} onto itself"
        )));
    }
    if start > end {
        return Err(ShardError::ProtocolMisuse(format!(
            "empty slot range {start}-{end}"
        )));
    }
    let lookup = |id: &ClusterId| {
        table
            .get(id)
            .ok_or_else(|| ShardError::ProtocolMisuse(format!("cluster {id} is not in the table")))
    };
    Ok((lookup(from)?, lookup(to)?))
}

fn require_coverage(
    entry: &ShardGroupEntry,
    start: Slot,
    end: Slot,
    ownership: SlotOwnership,
) -> ShardResult<()> {
    let covered: u32 = entry
        .slot_ranges
        .iter()
        .filter(|r| r.ownership == ownership && r.overlaps(start, end))
        .map(|r| u32::from(r.end.min(end) - r.start.max(start)) + 1)
        .sum();
    if covered != u32::from(end - start) + 1 {
        return Err(ShardError::ProtocolMisuse(format!(
            "slots {start}-{end} are not all {ownership:?} on cluster {}",
            entry.cluster_id
        )));
    }
    Ok(())
}

/// Cut `ranges` at the boundaries of `start..=end`, mapping the inner pieces
/// through `inner` (returning `None` drops the piece).
fn split(
    ranges: &[SlotRange],
    start: Slot,
    end: Slot,
    inner: impl Fn(SlotRange) -> Option<SlotRange>,
) -> Vec<SlotRange> {
    let mut out = Vec::with_capacity(ranges.len() + 2);
    for range in ranges {
        if !range.overlaps(start, end) {
            out.push(*range);
            continue;
        }
        if range.start < start {
            out.push(SlotRange { end: start - 1, ..*range });
        }
        let middle = SlotRange {
            start: range.start.max(start),
            end: range.end.min(end),
            ..*range
        };
        out.extend(inner(middle));
        if range.end > end {
            out.push(SlotRange { start: end + 1, ..*range });
        }
    }
    out
}

/// Replace an entry's ranges, coalescing adjacent ones of equal ownership
/// and stamping all of them with `term`.
fn install(table: &mut ShardGroupTable, cluster_id: &ClusterId, mut ranges: Vec<SlotRange>, term: u64) {
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<SlotRange> = Vec::with_capacity(ranges.len());
    for mut range in ranges {
        range.term = term;
        match merged.last_mut() {
            Some(prev) if prev.ownership == range.ownership && u32::from(prev.end) + 1 == u32::from(range.start) => {
                prev.end = range.end;
            }
            _ => merged.push(range),
        }
    }
    if let Some(entry) = table.groups.get_mut(cluster_id) {
        entry.slot_ranges = merged;
    }
}
