use std::collections::{HashMap, VecDeque};

use flightcast_learning::{FeatureCodec, FeatureRecord};
use shared_feeds::TopicCursor;

/// Per-key FIFO windows holding at most `capacity` recent records each.
#[derive(Debug, Clone)]
pub struct BoundedKeyBuffer {
    capacity: usize,
    windows: HashMap<String, VecDeque<FeatureRecord>>,
}

/// Counters from replaying a training topic into a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Records appended.
    pub restored: usize,
    /// Records that failed to decode.
    pub skipped: usize,
}

impl BoundedKeyBuffer {
    /// Empty buffer; a zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: HashMap::new(),
        }
    }

    /// Records kept per key.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends at the tail, evicting the oldest record when the window is full.
    ///
    /// Returns the window length after the insert.
    pub fn append(&mut self, record: FeatureRecord) -> usize {
        let window = self
            .windows
            .entry(record.key().to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(record);
        window.len()
    }

    /// Window for `key`, oldest first; empty when the key was never seen.
    #[must_use]
    pub fn snapshot(&self, key: &str) -> Vec<FeatureRecord> {
        self.windows
            .get(key)
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records currently held for `key`.
    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.windows.get(key).map_or(0, VecDeque::len)
    }

    /// Whether no key has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Keys with a window.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// Refills windows from `cursor` up to the high watermarks observed on entry.
    ///
    /// Only decoding happens here; nothing is trained.
    pub fn restore(&mut self, cursor: &mut TopicCursor, codec: &FeatureCodec) -> RestoreStats {
        let limits = cursor.end_offsets();
        let mut stats = RestoreStats::default();
        loop {
            let batch = cursor.poll_until(&limits, 512);
            if batch.is_empty() {
                break;
            }
            for record in batch {
                match record.value_str().ok().map(|raw| codec.decode(raw)) {
                    Some(Ok(decoded)) => {
                        self.append(decoded);
                        stats.restored += 1;
                    }
                    _ => stats.skipped += 1,
                }
            }
        }
        stats
    }
}
