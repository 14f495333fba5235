//! Replicated key -> latest model snapshot map, fed only by the change-log.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use flightcast_learning::Telemetry;
use serde_json::json;
use shared_feeds::{FeedRecord, Topic, TopicCursor};
use shared_logging::LogLevel;
use tokio::sync::watch;

/// Serialized model for one key, versioned by its change-log offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSnapshot {
    /// Partition key.
    pub key: String,
    /// Opaque trainer bytes.
    pub weights: Vec<u8>,
    /// Change-log offset the snapshot was read from.
    pub version: u64,
}

/// Read-only view of the replica. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    entries: Arc<DashMap<String, Arc<ModelSnapshot>>>,
}

impl ModelTable {
    /// Latest snapshot for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<ModelSnapshot>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Keys with a snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no snapshot has been replicated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every snapshot, ordered by key.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Arc<ModelSnapshot>> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

/// What applying one change-log record did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Stored as the newest snapshot.
    Updated,
    /// Tombstone removed the key.
    Removed,
    /// Version not newer than the stored one.
    Stale,
}

/// Sole writer of a [`ModelTable`], tailing the compacted change-log.
#[derive(Debug)]
pub struct ModelTableReplicator {
    table: ModelTable,
    cursor: TopicCursor,
    telemetry: Option<Telemetry>,
}

const POLL_BATCH: usize = 256;

impl ModelTableReplicator {
    /// Replicator over every partition of `changelog`, starting at the earliest offset.
    #[must_use]
    pub fn new(changelog: Arc<Topic>) -> Self {
        Self {
            table: ModelTable::default(),
            cursor: TopicCursor::all(changelog),
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Read handle onto the replica.
    #[must_use]
    pub fn table(&self) -> ModelTable {
        self.table.clone()
    }

    /// Applies one change-log record.
    ///
    /// Records with a version not greater than the stored snapshot's are ignored,
    /// so replaying the log is harmless. An empty value removes the key.
    pub fn apply(&self, record: &FeedRecord) -> ApplyOutcome {
        if record.is_tombstone() {
            let removed = self
                .table
                .entries
                .remove_if(&record.key, |_, current| current.version < record.offset);
            return if removed.is_some() {
                ApplyOutcome::Removed
            } else {
                ApplyOutcome::Stale
            };
        }
        let snapshot = Arc::new(ModelSnapshot {
            key: record.key.clone(),
            weights: record.value.clone(),
            version: record.offset,
        });
        let mut outcome = ApplyOutcome::Updated;
        self.table
            .entries
            .entry(record.key.clone())
            .and_modify(|current| {
                if current.version < snapshot.version {
                    *current = Arc::clone(&snapshot);
                } else {
                    outcome = ApplyOutcome::Stale;
                }
            })
            .or_insert_with(|| Arc::clone(&snapshot));
        outcome
    }

    /// Applies everything currently readable; returns the number of records applied.
    pub fn catch_up(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let batch = self.cursor.poll(POLL_BATCH);
            if batch.is_empty() {
                return applied;
            }
            applied += batch.len();
            for record in &batch {
                let outcome = self.apply(record);
                self.log(
                    LogLevel::Debug,
                    "model_table.apply",
                    json!({ "key": record.key, "version": record.offset, "outcome": format!("{outcome:?}") }),
                );
            }
        }
    }

    /// Reads the change-log up to the high watermark observed on entry.
    ///
    /// Scoring starts only after this returns, so every instance serves the
    /// models that existed at startup.
    pub fn bootstrap(&mut self) -> usize {
        let limits: BTreeMap<u32, u64> = self.cursor.end_offsets();
        let mut applied = 0;
        loop {
            let batch = self.cursor.poll_until(&limits, POLL_BATCH);
            if batch.is_empty() {
                break;
            }
            applied += batch.len();
            for record in &batch {
                self.apply(record);
            }
        }
        self.log(
            LogLevel::Info,
            "model_table.bootstrapped",
            json!({ "records": applied, "keys": self.table.len() }),
        );
        applied
    }

    /// Tails the change-log until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.cursor.topic().subscribe();
        loop {
            changes.borrow_and_update();
            self.catch_up();
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                stopped = shutdown.changed() => {
                    if stopped.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
        self.log(
            LogLevel::Info,
            "model_table.stopped",
            json!({ "keys": self.table.len() }),
        );
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_feeds::Cleanup;

    fn changelog() -> Arc<Topic> {
        Arc::new(Topic::new(
            "onlineRegression-by-airport",
            2,
            Cleanup::Compact { every: 1_000 },
        ))
    }

    #[test]
    fn later_offsets_win_and_stale_ones_are_ignored() {
        let topic = changelog();
        let replicator = ModelTableReplicator::new(Arc::clone(&topic));
        let first = topic.append("JFK", b"v1".to_vec()).unwrap();
        let second = topic.append("JFK", b"v2".to_vec()).unwrap();
        assert_eq!(replicator.apply(&first), ApplyOutcome::Updated);
        assert_eq!(replicator.apply(&second), ApplyOutcome::Updated);
        assert_eq!(replicator.apply(&first), ApplyOutcome::Stale);
        let table = replicator.table();
        let snapshot = table.get("JFK").unwrap();
        assert_eq!(snapshot.weights, b"v2".to_vec());
        assert_eq!(snapshot.version, second.offset);
    }

    #[test]
    fn tombstones_remove_keys() {
        let topic = changelog();
        let mut replicator = ModelTableReplicator::new(Arc::clone(&topic));
        topic.append("LAX", b"model".to_vec()).unwrap();
        topic.append("LAX", Vec::new()).unwrap();
        replicator.catch_up();
        assert!(replicator.table().get("LAX").is_none());
    }

    #[test]
    fn bootstrap_stops_at_the_startup_watermark() {
        let topic = changelog();
        topic.append("JFK", b"a".to_vec()).unwrap();
        topic.append("ORD", b"b".to_vec()).unwrap();
        let mut replicator = ModelTableReplicator::new(Arc::clone(&topic));
        assert_eq!(replicator.bootstrap(), 2);
        assert_eq!(replicator.table().len(), 2);
        topic.append("BOS", b"c".to_vec()).unwrap();
        assert_eq!(replicator.bootstrap(), 1);
        assert_eq!(
            replicator
                .table()
                .snapshots()
                .iter()
                .map(|snapshot| snapshot.key.as_str())
                .collect::<Vec<_>>(),
            vec!["BOS", "JFK", "ORD"]
        );
    }

    #[test]
    fn compacted_replay_matches_full_replay() {
        let topic = changelog();
        for (key, value) in [("JFK", "1"), ("LAX", "2"), ("JFK", "3"), ("SFO", "4"), ("LAX", "5")] {
            topic.append(key, value.as_bytes().to_vec()).unwrap();
        }
        let mut full = ModelTableReplicator::new(Arc::clone(&topic));
        full.catch_up();
        topic.compact().unwrap();
        let mut compacted = ModelTableReplicator::new(Arc::clone(&topic));
        compacted.catch_up();
        assert_eq!(full.table().snapshots(), compacted.table().snapshots());
    }

    #[tokio::test]
    async fn run_tails_until_shutdown() {
        let topic = changelog();
        let replicator = ModelTableReplicator::new(Arc::clone(&topic));
        let table = replicator.table();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(replicator.run(shutdown));
        topic.append("DEN", b"model".to_vec()).unwrap();
        for _ in 0..100 {
            if table.get("DEN").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(table.get("DEN").is_some());
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
