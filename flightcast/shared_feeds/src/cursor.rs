use std::{collections::BTreeMap, sync::Arc};

use crate::{FeedRecord, Topic};

/// Consumer position over a subset of a topic's partitions.
///
/// Records of one partition come back in offset order; partitions are polled
/// round-robin so a busy partition cannot starve the others.
#[derive(Debug, Clone)]
pub struct TopicCursor {
    topic: Arc<Topic>,
    positions: BTreeMap<u32, u64>,
}

impl TopicCursor {
    /// Cursor over `partitions`, starting at the earliest retained offsets.
    #[must_use]
    pub fn new(topic: Arc<Topic>, partitions: impl IntoIterator<Item = u32>) -> Self {
        let positions = partitions
            .into_iter()
            .filter(|partition| *partition < topic.partition_count())
            .map(|partition| (partition, topic.earliest_offset(partition)))
            .collect();
        Self { topic, positions }
    }

    /// Cursor over every partition of the topic.
    #[must_use]
    pub fn all(topic: Arc<Topic>) -> Self {
        let count = topic.partition_count();
        Self::new(topic, 0..count)
    }

    /// Underlying topic.
    #[must_use]
    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    /// Partitions this cursor reads.
    pub fn partitions(&self) -> impl Iterator<Item = u32> + '_ {
        self.positions.keys().copied()
    }

    /// Next offset to read in `partition`.
    #[must_use]
    pub fn position(&self, partition: u32) -> Option<u64> {
        self.positions.get(&partition).copied()
    }

    /// Moves every partition to its current high watermark.
    pub fn seek_to_end(&mut self) {
        for (partition, position) in &mut self.positions {
            *position = self.topic.high_watermark(*partition);
        }
    }

    /// Current high watermark of every partition.
    #[must_use]
    pub fn end_offsets(&self) -> BTreeMap<u32, u64> {
        self.positions
            .keys()
            .map(|partition| (*partition, self.topic.high_watermark(*partition)))
            .collect()
    }

    /// Whether every partition has been read up to `targets`.
    #[must_use]
    pub fn reached(&self, targets: &BTreeMap<u32, u64>) -> bool {
        targets
            .iter()
            .all(|(partition, target)| self.position(*partition).map_or(true, |pos| pos >= *target))
    }

    /// Up to `max_per_partition` new records from each partition.
    pub fn poll(&mut self, max_per_partition: usize) -> Vec<FeedRecord> {
        let mut batch = Vec::new();
        for (partition, position) in &mut self.positions {
            let records = self.topic.fetch(*partition, *position, max_per_partition);
            if let Some(last) = records.last() {
                *position = last.offset + 1;
            }
            batch.extend(records);
        }
        batch
    }

    /// Like [`poll`](Self::poll) but never reads past `limits` (exclusive).
    pub fn poll_until(
        &mut self,
        limits: &BTreeMap<u32, u64>,
        max_per_partition: usize,
    ) -> Vec<FeedRecord> {
        let mut batch = Vec::new();
        for (partition, position) in &mut self.positions {
            let Some(limit) = limits.get(partition).copied() else {
                continue;
            };
            if *position >= limit {
                continue;
            }
            let records: Vec<FeedRecord> = self
                .topic
                .fetch(*partition, *position, max_per_partition)
                .into_iter()
                .take_while(|record| record.offset < limit)
                .collect();
            *position = records.last().map_or(limit, |last| last.offset + 1);
            batch.extend(records);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cleanup;

    #[test]
    fn poll_advances_positions_in_order() {
        let topic = Arc::new(Topic::new("t", 2, Cleanup::Retain));
        topic.append_to(0, "a", b"0".to_vec()).unwrap();
        topic.append_to(1, "b", b"1".to_vec()).unwrap();
        topic.append_to(0, "a", b"2".to_vec()).unwrap();
        let mut cursor = TopicCursor::new(Arc::clone(&topic), [0]);
        let first = cursor.poll(1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].value, b"0".to_vec());
        let second = cursor.poll(10);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].value, b"2".to_vec());
        assert!(cursor.poll(10).is_empty());
        assert_eq!(cursor.position(0), Some(2));
        assert_eq!(cursor.position(1), None);
    }

    #[test]
    fn seek_to_end_skips_history() {
        let topic = Arc::new(Topic::new("t", 1, Cleanup::Retain));
        topic.append("k", b"old".to_vec()).unwrap();
        let mut cursor = TopicCursor::all(Arc::clone(&topic));
        cursor.seek_to_end();
        topic.append("k", b"new".to_vec()).unwrap();
        let batch = cursor.poll(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, b"new".to_vec());
    }

    #[test]
    fn poll_until_stops_at_limit() {
        let topic = Arc::new(Topic::new("t", 1, Cleanup::Retain));
        for idx in 0..5u8 {
            topic.append("k", vec![idx]).unwrap();
        }
        let mut cursor = TopicCursor::all(Arc::clone(&topic));
        let limits = BTreeMap::from([(0, 3)]);
        let batch = cursor.poll_until(&limits, 10);
        assert_eq!(batch.len(), 3);
        assert!(cursor.reached(&limits));
        assert!(cursor.poll_until(&limits, 10).is_empty());
    }

    #[test]
    fn retention_moves_stale_positions_forward() {
        let topic = Arc::new(Topic::new("t", 1, Cleanup::Delete { max_records: 2 }));
        let mut cursor = TopicCursor::all(Arc::clone(&topic));
        for idx in 0..5u8 {
            topic.append("k", vec![idx]).unwrap();
        }
        let batch = cursor.poll(10);
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4]);
    }
}
