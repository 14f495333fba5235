use std::{
    collections::{HashMap, VecDeque},
    fmt,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{journal::Journal, partition_for, Cleanup, FeedRecord};

#[derive(Debug, Default)]
struct PartitionLog {
    entries: VecDeque<FeedRecord>,
    next_offset: u64,
}

impl PartitionLog {
    fn earliest(&self) -> u64 {
        self.entries.front().map_or(self.next_offset, |record| record.offset)
    }

    fn position(&self, offset: u64) -> usize {
        self.entries.partition_point(|record| record.offset < offset)
    }

    fn trim_to(&mut self, max_records: usize) -> usize {
        let excess = self.entries.len().saturating_sub(max_records);
        self.entries.drain(..excess);
        excess
    }

    fn compact(&mut self) -> usize {
        let keep: Vec<u64> = {
            let mut latest: HashMap<&str, u64> = HashMap::with_capacity(self.entries.len());
            for record in &self.entries {
                latest.insert(record.key.as_str(), record.offset);
            }
            self.entries
                .iter()
                .filter(|record| latest.get(record.key.as_str()) == Some(&record.offset))
                .map(|record| record.offset)
                .collect()
        };
        let before = self.entries.len();
        let mut keep = keep.into_iter().peekable();
        self.entries.retain(|record| {
            if keep.peek() == Some(&record.offset) {
                keep.next();
                true
            } else {
                false
            }
        });
        before - self.entries.len()
    }
}

/// Partitioned append-only log with change notification.
pub struct Topic {
    name: String,
    cleanup: Cleanup,
    partitions: Vec<Mutex<PartitionLog>>,
    journal: Option<Journal>,
    appends_since_compaction: AtomicUsize,
    trimmed_since_rewrite: AtomicUsize,
    changes: watch::Sender<u64>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("partitions", &self.partitions.len())
            .field("cleanup", &self.cleanup)
            .field("journal", &self.journal.as_ref().map(Journal::path))
            .finish()
    }
}

impl Topic {
    /// In-memory topic.
    #[must_use]
    pub fn new(name: impl Into<String>, partitions: u32, cleanup: Cleanup) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            name: name.into(),
            cleanup,
            partitions: (0..partitions.max(1))
                .map(|_| Mutex::new(PartitionLog::default()))
                .collect(),
            journal: None,
            appends_since_compaction: AtomicUsize::new(0),
            trimmed_since_rewrite: AtomicUsize::new(0),
            changes,
        }
    }

    /// Journaled topic; existing records at `path` are replayed first.
    pub fn open(
        name: impl Into<String>,
        partitions: u32,
        cleanup: Cleanup,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut topic = Self::new(name, partitions, cleanup);
        let journal = Journal::open(path)?;
        journal.pin_partitions(topic.partition_count())?;
        let partition_count = topic.partitions.len();
        let mut trimmed = 0;
        for record in journal.replay()? {
            let Some(slot) = topic.partitions.get_mut(record.partition as usize) else {
                bail!(
                    "journal {} has partition {} but topic '{}' has {partition_count}",
                    journal.path().display(),
                    record.partition,
                    topic.name,
                );
            };
            let log = slot.get_mut();
            log.next_offset = log.next_offset.max(record.offset + 1);
            log.entries.push_back(record);
        }
        for slot in &mut topic.partitions {
            let log = slot.get_mut();
            log.entries.make_contiguous().sort_by_key(|record| record.offset);
            if let Cleanup::Delete { max_records } = cleanup {
                trimmed += log.trim_to(max_records);
            }
        }
        topic.journal = Some(journal);
        if matches!(cleanup, Cleanup::Compact { .. }) {
            topic.compact()?;
        } else if trimmed > 0 {
            topic.rewrite_journal()?;
        }
        Ok(topic)
    }

    /// Topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cleanup policy.
    #[must_use]
    pub const fn cleanup(&self) -> Cleanup {
        self.cleanup
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> u32 {
        u32::try_from(self.partitions.len()).unwrap_or(u32::MAX)
    }

    /// Partition that `key` routes to.
    #[must_use]
    pub fn partition_of(&self, key: &str) -> u32 {
        partition_for(key, self.partition_count())
    }

    /// Appends to the partition chosen by the key hash.
    pub fn append(&self, key: &str, value: Vec<u8>) -> Result<FeedRecord> {
        self.append_to(self.partition_of(key), key, value)
    }

    /// Appends to an explicit partition.
    ///
    /// The record is journaled before it becomes visible, so a failed write
    /// leaves no trace in memory. Under delete retention the journal is
    /// rewritten once `max_records` records have been trimmed since the last
    /// rewrite, so it never holds more than the retained records plus that many.
    pub fn append_to(&self, partition: u32, key: &str, value: Vec<u8>) -> Result<FeedRecord> {
        let Some(slot) = self.partitions.get(partition as usize) else {
            bail!("topic '{}' has no partition {partition}", self.name);
        };
        let mut trimmed = 0;
        let record = {
            let mut log = slot.lock();
            let record = FeedRecord {
                partition,
                offset: log.next_offset,
                key: key.to_string(),
                value,
                timestamp: Utc::now(),
            };
            if let Some(journal) = &self.journal {
                journal.append(&record)?;
            }
            log.next_offset += 1;
            log.entries.push_back(record.clone());
            if let Cleanup::Delete { max_records } = self.cleanup {
                trimmed = log.trim_to(max_records);
            }
            record
        };
        self.changes.send_modify(|generation| *generation += 1);
        if trimmed > 0 && self.journal.is_some() {
            if let Cleanup::Delete { max_records } = self.cleanup {
                let pending =
                    self.trimmed_since_rewrite.fetch_add(trimmed, Ordering::AcqRel) + trimmed;
                if pending >= max_records.max(1) {
                    self.rewrite_journal()?;
                }
            }
        }
        if let Cleanup::Compact { every } = self.cleanup {
            let appended = self.appends_since_compaction.fetch_add(1, Ordering::AcqRel) + 1;
            if appended >= every.max(1) {
                self.compact()?;
            }
        }
        Ok(record)
    }

    /// Up to `max` records of `partition` starting at `from` (or the earliest retained offset).
    #[must_use]
    pub fn fetch(&self, partition: u32, from: u64, max: usize) -> Vec<FeedRecord> {
        let Some(slot) = self.partitions.get(partition as usize) else {
            return Vec::new();
        };
        let log = slot.lock();
        let start = log.position(from);
        log.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Offset the next append to `partition` will receive.
    #[must_use]
    pub fn high_watermark(&self, partition: u32) -> u64 {
        self.partitions
            .get(partition as usize)
            .map_or(0, |slot| slot.lock().next_offset)
    }

    /// Oldest offset still retained in `partition`.
    #[must_use]
    pub fn earliest_offset(&self, partition: u32) -> u64 {
        self.partitions
            .get(partition as usize)
            .map_or(0, |slot| slot.lock().earliest())
    }

    /// Records currently retained across all partitions.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.partitions.iter().map(|slot| slot.lock().entries.len()).sum()
    }

    /// Change notifications; the value increases on every append.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Keeps only the latest record per key in every partition and rewrites the journal.
    ///
    /// Offsets of surviving records are unchanged. Returns the number of records removed.
    pub fn compact(&self) -> Result<usize> {
        let mut logs: Vec<_> = self.partitions.iter().map(|slot| slot.lock()).collect();
        let removed: usize = logs.iter_mut().map(|log| log.compact()).sum();
        self.appends_since_compaction.store(0, Ordering::Release);
        if removed > 0 {
            if let Some(journal) = &self.journal {
                journal.rewrite(logs.iter().flat_map(|log| log.entries.iter()))?;
            }
        }
        Ok(removed)
    }

    fn rewrite_journal(&self) -> Result<()> {
        let logs: Vec<_> = self.partitions.iter().map(|slot| slot.lock()).collect();
        self.trimmed_since_rewrite.store(0, Ordering::Release);
        if let Some(journal) = &self.journal {
            journal.rewrite(logs.iter().flat_map(|log| log.entries.iter()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn offsets_are_dense_per_partition() {
        let topic = Topic::new("t", 1, Cleanup::Retain);
        for idx in 0..5 {
            let record = topic.append("JFK", vec![idx]).unwrap();
            assert_eq!(record.offset, u64::from(idx));
        }
        let fetched = topic.fetch(0, 2, 2);
        assert_eq!(fetched.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(topic.high_watermark(0), 5);
    }

    #[test]
    fn delete_retention_keeps_newest_records() {
        let topic = Topic::new("t", 1, Cleanup::Delete { max_records: 3 });
        for idx in 0..6u8 {
            topic.append("k", vec![idx]).unwrap();
        }
        assert_eq!(topic.earliest_offset(0), 3);
        let fetched = topic.fetch(0, 0, 10);
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[0].value, vec![3]);
    }

    #[test]
    fn compaction_keeps_latest_per_key_and_offsets() {
        let topic = Topic::new("models", 1, Cleanup::Compact { every: 1000 });
        topic.append_to(0, "JFK", b"a".to_vec()).unwrap();
        topic.append_to(0, "LAX", b"b".to_vec()).unwrap();
        topic.append_to(0, "JFK", b"c".to_vec()).unwrap();
        let removed = topic.compact().unwrap();
        assert_eq!(removed, 1);
        let records = topic.fetch(0, 0, 10);
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].key.as_str(), records[0].offset), ("LAX", 1));
        assert_eq!((records[1].key.as_str(), records[1].offset), ("JFK", 2));
        assert_eq!(topic.high_watermark(0), 3);
    }

    #[test]
    fn automatic_compaction_triggers_after_threshold() {
        let topic = Topic::new("models", 1, Cleanup::Compact { every: 4 });
        for idx in 0..4u8 {
            topic.append_to(0, "JFK", vec![idx]).unwrap();
        }
        assert_eq!(topic.retained(), 1);
        assert_eq!(topic.fetch(0, 0, 10)[0].value, vec![3]);
    }

    #[test]
    fn compaction_rewrites_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models.jsonl");
        {
            let topic = Topic::open("models", 1, Cleanup::Compact { every: 100 }, &path).unwrap();
            topic.append_to(0, "JFK", b"old".to_vec()).unwrap();
            topic.append_to(0, "JFK", b"new".to_vec()).unwrap();
            topic.compact().unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        let topic = Topic::open("models", 1, Cleanup::Compact { every: 100 }, &path).unwrap();
        assert_eq!(topic.high_watermark(0), 2);
        assert_eq!(topic.fetch(0, 0, 10)[0].value, b"new".to_vec());
    }

    #[test]
    fn reopening_with_fewer_partitions_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        {
            let topic = Topic::open("t", 4, Cleanup::Retain, &path).unwrap();
            topic.append_to(3, "k", b"v".to_vec()).unwrap();
        }
        assert!(Topic::open("t", 2, Cleanup::Retain, &path).is_err());
    }

    #[test]
    fn reopening_with_more_partitions_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models.jsonl");
        {
            let topic = Topic::open("models", 2, Cleanup::Compact { every: 100 }, &path).unwrap();
            topic.append("JFK", vec![1]).unwrap();
        }
        let err = Topic::open("models", 4, Cleanup::Compact { every: 100 }, &path).unwrap_err();
        assert!(err.to_string().contains("2 partitions"));
        let topic = Topic::open("models", 2, Cleanup::Compact { every: 100 }, &path).unwrap();
        assert_eq!(topic.retained(), 1);
    }

    #[test]
    fn delete_retention_bounds_the_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw-airline-data.jsonl");
        {
            let topic = Topic::open("raw-airline-data", 1, Cleanup::Delete { max_records: 3 }, &path)
                .unwrap();
            for idx in 0..1000u32 {
                topic.append("JFK", idx.to_le_bytes().to_vec()).unwrap();
                let lines = std::fs::read_to_string(&path).unwrap().lines().count();
                assert!(lines <= 6, "journal holds {lines} lines after {idx}");
            }
            assert_eq!(topic.retained(), 3);
        }
        let topic =
            Topic::open("raw-airline-data", 1, Cleanup::Delete { max_records: 3 }, &path).unwrap();
        let offsets: Vec<u64> = topic.fetch(0, 0, 10).iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![997, 998, 999]);
        assert_eq!(topic.high_watermark(0), 1000);
    }

    #[test]
    fn reopening_trims_an_oversized_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        {
            let topic = Topic::open("t", 1, Cleanup::Retain, &path).unwrap();
            for idx in 0..10u8 {
                topic.append("k", vec![idx]).unwrap();
            }
        }
        let topic = Topic::open("t", 1, Cleanup::Delete { max_records: 4 }, &path).unwrap();
        assert_eq!(topic.earliest_offset(0), 6);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 4);
    }

    #[test]
    fn unknown_partition_is_rejected() {
        let topic = Topic::new("t", 2, Cleanup::Retain);
        assert!(topic.append_to(5, "k", vec![1]).is_err());
        assert!(topic.fetch(5, 0, 1).is_empty());
    }

    #[tokio::test]
    async fn subscribers_observe_appends() {
        let topic = std::sync::Arc::new(Topic::new("t", 1, Cleanup::Retain));
        let mut changes = topic.subscribe();
        let writer = std::sync::Arc::clone(&topic);
        tokio::spawn(async move {
            writer.append("k", b"v".to_vec()).unwrap();
        });
        tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic.high_watermark(0), 1);
    }
}
