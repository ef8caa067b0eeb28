//! Slot migration coordinator.
//!
//! Migrating a slot range is staged, and this module owns only step 2:
//! 1. operator REPLACEs tables marking the range migrating-out / importing
//! 2. coordinator drains every key of each slot from source to destination
//! 3. operator REPLACEs tables making the destination the stable owner
//!
//! The coordinator never changes ownership.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};
use crate::slot::Slot;
use crate::store::{ClusterStore, ScanPage};
use crate::table::{ClusterId, SlotOwnership};

#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// Keys requested per `scan_slot` call; each non-empty page is one
    /// relocation batch.
    pub batch_size: usize,
    /// Retries of one scan or relocation on `TransientUnavailable`;
    /// relocations are also replayed after `Indeterminate`.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_retries: 50,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

/// Scan position within one slot of one cluster. Position 0 starts a scan;
/// a returned position of 0 means the slot is exhausted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCursor {
    pub cluster_id: ClusterId,
    pub slot: Slot,
    pub position: u64,
}

impl MigrationCursor {
    pub fn start(cluster_id: ClusterId, slot: Slot) -> Self {
        Self {
            cluster_id,
            slot,
            position: 0,
        }
    }
}

/// Outcome of draining one slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub slot: Slot,
    pub batches: u64,
    /// Keys the source acknowledged moving. A batch replayed after a lost
    /// reply counts only what the replay moved.
    pub keys_moved: u64,
    /// Pages with no keys but a non-zero next cursor.
    pub empty_pages: u64,
    pub retries: u64,
}

/// Moves every key of a slot from `source` to `destination`.
pub struct MigrationCoordinator {
    source: Arc<dyn ClusterStore>,
    destination: ClusterId,
    config: MigrationConfig,
}

impl MigrationCoordinator {
    pub fn new(source: Arc<dyn ClusterStore>, destination: ClusterId, config: MigrationConfig) -> Self {
        Self {
            source,
            destination,
            config,
        }
    }

    pub fn source(&self) -> &ClusterId {
        self.source.cluster_id()
    }

    pub fn destination(&self) -> &ClusterId {
        &self.destination
    }

    /// Drain `slot`. Requires the source to have the slot migrating out.
    pub async fn migrate_slot(&self, slot: Slot) -> ShardResult<MigrationReport> {
        let mut report = MigrationReport {
            slot,
            ..MigrationReport::default()
        };
        self.verify_migrating(slot, &mut report).await?;
        self.drain(MigrationCursor::start(self.source().clone(), slot), &mut report)
            .await?;
        tracing::info!(
            source = %self.source(),
            destination = %self.destination,
            slot,
            batches = report.batches,
            keys_moved = report.keys_moved,
            empty_pages = report.empty_pages,
            retries = report.retries,
            "slot migration complete"
        );
        Ok(report)
    }

    /// Continue draining from a cursor returned by an interrupted run.
    pub async fn resume(&self, cursor: MigrationCursor) -> ShardResult<MigrationReport> {
        if cursor.cluster_id != *self.source() {
            return Err(ShardError::ProtocolMisuse(format!(
                "cursor belongs to cluster {}, not {}",
                cursor.cluster_id,
                self.source()
            )));
        }
        let mut report = MigrationReport {
            slot: cursor.slot,
            ..MigrationReport::default()
        };
        self.verify_migrating(cursor.slot, &mut report).await?;
        self.drain(cursor, &mut report).await?;
        Ok(report)
    }

    /// Drain every slot in `start..=end`, in order.
    pub async fn migrate_range(&self, start: Slot, end: Slot) -> ShardResult<Vec<MigrationReport>> {
        if start > end {
            return Err(ShardError::ProtocolMisuse(format!(
                "empty slot range {start}-{end}"
            )));
        }
        let mut reports = Vec::with_capacity(usize::from(end - start) + 1);
        for slot in start..=end {
            reports.push(self.migrate_slot(slot).await?);
        }
        Ok(reports)
    }

    /// Rescan `slot` from the beginning; true when the source holds no key
    /// of it.
    pub async fn verify_vacated(&self, slot: Slot) -> ShardResult<bool> {
        let mut report = MigrationReport::default();
        let mut position = 0;
        loop {
            let page = self.scan(position, slot, &mut report).await?;
            if !page.keys.is_empty() {
                tracing::warn!(
                    source = %self.source(),
                    slot,
                    remaining = page.keys.len(),
                    "slot still holds keys after migration"
                );
                return Ok(false);
            }
            if page.next_cursor == 0 {
                return Ok(true);
            }
            position = page.next_cursor;
        }
    }

    async fn verify_migrating(&self, slot: Slot, report: &mut MigrationReport) -> ShardResult<()> {
        let table = self
            .with_retries(report, "shard_groups", ShardError::is_retryable, || {
                self.source.shard_groups()
            })
            .await?;
        let source_state = table
            .get(self.source())
            .and_then(|entry| entry.ownership_of(slot));
        if source_state != Some(SlotOwnership::MigratingOut) {
            return Err(ShardError::ProtocolMisuse(format!(
                "slot {slot} is {source_state:?} on {}, expected migrating out",
                self.source()
            )));
        }
        // RESP clusters only report their own entry.
        if let Some(entry) = table.get(&self.destination) {
            if entry.ownership_of(slot) != Some(SlotOwnership::Importing) {
                return Err(ShardError::ProtocolMisuse(format!(
                    "slot {slot} is not importing on {}",
                    self.destination
                )));
            }
        }
        Ok(())
    }

    async fn drain(&self, mut cursor: MigrationCursor, report: &mut MigrationReport) -> ShardResult<()> {
        loop {
            let page = self.scan(cursor.position, cursor.slot, report).await?;
            if page.keys.is_empty() {
                if page.next_cursor != 0 {
                    report.empty_pages += 1;
                }
            } else {
                // A batch is idempotent, so one whose reply was lost is
                // replayed like one that was refused.
                let moved = self
                    .with_retries(report, "relocate_keys", replayable, || {
                        self.source.relocate_keys(&self.destination, &page.keys)
                    })
                    .await
                    .inspect_err(|err| {
                        tracing::warn!(
                            source = %self.source(),
                            destination = %self.destination,
                            slot = cursor.slot,
                            position = cursor.position,
                            error = %err,
                            "relocation batch failed"
                        );
                    })?;
                report.batches += 1;
                report.keys_moved += moved as u64;
                tracing::debug!(
                    slot = cursor.slot,
                    position = cursor.position,
                    requested = page.keys.len(),
                    moved,
                    "relocated batch"
                );
            }
            if page.next_cursor == 0 {
                return Ok(());
            }
            if page.next_cursor == cursor.position {
                return Err(ShardError::ProtocolMisuse(format!(
                    "scan cursor stalled at {} for slot {} on {}",
                    cursor.position,
                    cursor.slot,
                    self.source()
                )));
            }
            cursor.position = page.next_cursor;
        }
    }

    async fn scan(&self, position: u64, slot: Slot, report: &mut MigrationReport) -> ShardResult<ScanPage> {
        let count = self.config.batch_size.max(1);
        self.with_retries(report, "scan_slot", ShardError::is_retryable, || {
            self.source.scan_slot(position, slot, count)
        })
        .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        report: &mut MigrationReport,
        what: &'static str,
        retryable: fn(&ShardError) -> bool,
        mut op: F,
    ) -> ShardResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ShardResult<T>>,
    {
        let mut attempts = 0;
        loop {
            match op().await {
                Err(err) if retryable(&err) && attempts < self.config.max_retries => {
                    attempts += 1;
                    report.retries += 1;
                    tracing::debug!(
                        source = %self.source(),
                        op = what,
                        attempt = attempts,
                        error = %err,
                        "retrying after failed attempt"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                result => return result,
            }
        }
    }
}

fn replayable(err: &ShardError) -> bool {
    err.is_retryable() || !err.is_definite()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalCluster, LocalClusterConfig, LocalNetwork};
    use crate::operator::begin_migration;
    use crate::slot::{slot_of, MAX_SLOT};
    use crate::store::StoredValue;
    use crate::table::{ShardGroupEntry, ShardGroupTable, SlotRange};
    use bytes::Bytes;

    async fn setup() -> (Arc<LocalCluster>, Arc<LocalCluster>, ShardGroupTable) {
        let network = LocalNetwork::new();
        let c1 = LocalCluster::start(&network, LocalClusterConfig::new("c1"));
        let c2 = LocalCluster::start(&network, LocalClusterConfig::new("c2"));
        let table = ShardGroupTable::from_entries([
            ShardGroupEntry::new(ClusterId::new("c1")).with_range(SlotRange::stable(0, MAX_SLOT, 1)),
            ShardGroupEntry::new(ClusterId::new("c2")),
        ]);
        c1.configure_shard_groups(&table).await.unwrap();
        c2.configure_shard_groups(&table).await.unwrap();
        (c1, c2, table)
    }

    async fn begin(
        c1: &LocalCluster,
        c2: &LocalCluster,
        table: &ShardGroupTable,
        start: Slot,
        end: Slot,
    ) {
        let (id1, id2) = (ClusterId::new("c1"), ClusterId::new("c2"));
        let migrating = begin_migration(table, &id1, &id2, start, end).unwrap();
        c1.configure_shard_groups(&migrating).await.unwrap();
        c2.configure_shard_groups(&migrating).await.unwrap();
    }

    fn keys_in_slot(slot: Slot, prefix: &str, count: usize) -> Vec<Bytes> {
        (0u32..)
            .map(|i| format!("{prefix}{i}"))
            .filter(|key| slot_of(key.as_bytes()) == slot)
            .take(count)
            .map(Bytes::from)
            .collect()
    }

    fn coordinator(source: &Arc<LocalCluster>, batch_size: usize) -> MigrationCoordinator {
        MigrationCoordinator::new(
            source.clone(),
            ClusterId::new("c2"),
            MigrationConfig {
                batch_size,
                retry_backoff: Duration::from_millis(1),
                ..MigrationConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn refuses_slot_that_is_not_migrating() {
        let (c1, _c2, _) = setup().await;
        let err = coordinator(&c1, 4).migrate_slot(7).await.unwrap_err();
        assert!(matches!(err, ShardError::ProtocolMisuse(_)));
    }

    #[tokio::test]
    async fn drains_slot_through_sparse_pages_and_transient_failures() {
        let (c1, c2, table) = setup().await;
        let slot = slot_of(b"{test}key1");
        for idx in 0..10 {
            c1.set(format!("noise{idx}").as_bytes(), Bytes::from_static(b"n"), false)
                .await
                .unwrap();
            c1.append(format!("{{test}}key{idx}").as_bytes(), Bytes::from_static(b"v"), false)
                .await
                .unwrap();
        }
        let migrating = begin_migration(&table, &ClusterId::new("c1"), &ClusterId::new("c2"), slot, slot).unwrap();
        c1.configure_shard_groups(&migrating).await.unwrap();
        c2.configure_shard_groups(&migrating).await.unwrap();

        c1.fail_next_requests(2);
        let coordinator = coordinator(&c1, 3);
        let report = coordinator.migrate_slot(slot).await.unwrap();
        assert_eq!(report.keys_moved, 10);
        assert_eq!(report.retries, 2);
        assert!(report.batches >= 4);
        assert!(coordinator.verify_vacated(slot).await.unwrap());
        for idx in 0..10 {
            let key = format!("{{test}}key{idx}");
            assert_eq!(c1.local_value(key.as_bytes()), None);
            assert!(c2.local_value(key.as_bytes()).is_some());
        }
        assert!(c1.local_value(b"noise3").is_some());
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (c1, c2, table) = setup().await;
        let slot = slot_of(b"{test}key1");
        c1.append(b"{test}key1", Bytes::from_static(b"v"), false).await.unwrap();
        let migrating = begin_migration(&table, &ClusterId::new("c1"), &ClusterId::new("c2"), slot, slot).unwrap();
        c1.configure_shard_groups(&migrating).await.unwrap();
        c2.configure_shard_groups(&migrating).await.unwrap();

        c2.set_reachable(false);
        let coordinator = MigrationCoordinator::new(
            c1.clone(),
            ClusterId::new("c2"),
            MigrationConfig {
                batch_size: 8,
                max_retries: 3,
                retry_backoff: Duration::from_millis(1),
            },
        );
        let err = coordinator.migrate_slot(slot).await.unwrap_err();
        assert!(err.is_retryable());
        // Nothing was deleted from the source.
        assert!(c1.local_value(b"{test}key1").is_some());
    }

    #[tokio::test]
    async fn replays_batch_whose_reply_was_lost() {
        let (c1, c2, table) = setup().await;
        let slot = slot_of(b"{test}key1");
        let keys: [&[u8]; 2] = [b"{test}key1", b"{test}key2"];
        for key in keys {
            c1.append(key, Bytes::from_static(b"v"), false).await.unwrap();
        }
        begin(&c1, &c2, &table, slot, slot).await;

        // The batch is applied on both sides but the source's reply is lost.
        c1.lose_next_reply();
        let coordinator = coordinator(&c1, 4);
        let report = coordinator.migrate_slot(slot).await.unwrap();
        assert_eq!(report.retries, 1);
        assert!(coordinator.verify_vacated(slot).await.unwrap());
        for key in keys {
            assert_eq!(c1.local_value(key), None);
            assert_eq!(
                c2.local_value(key),
                Some(StoredValue::List(vec![Bytes::from_static(b"v")]))
            );
        }
    }

    #[tokio::test]
    async fn resumes_from_cursor_of_interrupted_run() {
        let (c1, c2, table) = setup().await;
        let slot = slot_of(b"{test}key0");
        for idx in 0..6 {
            c1.append(format!("{{test}}key{idx}").as_bytes(), Bytes::from_static(b"v"), false)
                .await
                .unwrap();
        }
        begin(&c1, &c2, &table, slot, slot).await;

        // An earlier run moved the first page and stopped.
        let page = c1.scan_slot(0, slot, 2).await.unwrap();
        assert_eq!(page.keys.len(), 2);
        assert_ne!(page.next_cursor, 0);
        assert_eq!(c1.relocate_keys(&ClusterId::new("c2"), &page.keys).await, Ok(2));

        let coordinator = coordinator(&c1, 2);
        let cursor = MigrationCursor {
            position: page.next_cursor,
            ..MigrationCursor::start(ClusterId::new("c1"), slot)
        };
        let report = coordinator.resume(cursor.clone()).await.unwrap();
        assert_eq!(report.slot, slot);
        assert_eq!(report.keys_moved, 4);
        assert!(coordinator.verify_vacated(slot).await.unwrap());
        for idx in 0..6 {
            let key = format!("{{test}}key{idx}");
            assert_eq!(c1.local_value(key.as_bytes()), None);
            assert!(c2.local_value(key.as_bytes()).is_some());
        }

        let foreign = MigrationCursor {
            cluster_id: ClusterId::new("c2"),
            ..cursor
        };
        let err = coordinator.resume(foreign).await.unwrap_err();
        assert!(matches!(err, ShardError::ProtocolMisuse(_)), "{err}");
    }

    #[tokio::test]
    async fn migrates_every_slot_of_a_range() {
        let (c1, c2, table) = setup().await;
        let (start, end) = (100, 101);
        let mut moved = Vec::new();
        for slot in start..=end {
            for key in keys_in_slot(slot, "r", 3) {
                c1.set(&key, Bytes::from_static(b"x"), false).await.unwrap();
                moved.push(key);
            }
        }
        c1.set(b"{test}key0", Bytes::from_static(b"stays"), false).await.unwrap();
        begin(&c1, &c2, &table, start, end).await;

        let coordinator = coordinator(&c1, 2);
        let reports = coordinator.migrate_range(start, end).await.unwrap();
        assert_eq!(reports.iter().map(|r| r.slot).collect::<Vec<_>>(), vec![100, 101]);
        assert!(reports.iter().all(|r| r.keys_moved == 3), "{reports:?}");
        for slot in start..=end {
            assert!(coordinator.verify_vacated(slot).await.unwrap());
        }
        for key in &moved {
            assert_eq!(c1.local_value(key), None);
            assert!(c2.local_value(key).is_some());
        }
        assert!(c1.local_value(b"{test}key0").is_some());

        let err = coordinator.migrate_range(5, 4).await.unwrap_err();
        assert!(matches!(err, ShardError::ProtocolMisuse(_)));
    }
}
