#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Feed abstractions for the flightcast pipeline.
//!
//! A [`Topic`] is a set of partitions, each an append-only log addressed by
//! dense offsets. Topics can be journaled to disk as JSON lines and replayed on
//! reopen, trimmed by record-count retention, or compacted down to the latest
//! record per key. A [`Broker`] hands out named topics sharing one partition
//! count so that feeds keyed the same way stay co-partitioned.

mod cursor;
mod journal;
mod topic;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use cursor::TopicCursor;
pub use topic::Topic;

/// One entry of a topic partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    /// Partition holding the record.
    pub partition: u32,
    /// Offset within the partition; never reused.
    pub offset: u64,
    /// Routing key.
    pub key: String,
    /// Payload bytes; empty means tombstone.
    #[serde(with = "value_base64")]
    pub value: Vec<u8>,
    /// Append time.
    pub timestamp: DateTime<Utc>,
}

impl FeedRecord {
    /// Whether the record deletes its key on compacted topics.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Payload interpreted as UTF-8 text.
    pub fn value_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.value)
            .with_context(|| format!("record {}@{} is not utf-8", self.partition, self.offset))
    }
}

/// Cleanup policy applied to a topic's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cleanup {
    /// Keep every record.
    #[default]
    Retain,
    /// Drop the oldest records once a partition exceeds `max_records`.
    Delete {
        /// Records retained per partition.
        max_records: usize,
    },
    /// Keep only the latest record per key, compacting after `every` appends.
    Compact {
        /// Appends between automatic compactions.
        every: usize,
    },
}

/// Producer seam used by ingestion and telemetry.
#[async_trait]
pub trait FeedPublisher: Send + Sync {
    /// Appends `value` under `key` and returns the stored record.
    async fn publish(&self, key: &str, value: Vec<u8>) -> Result<FeedRecord>;
}

#[async_trait]
impl FeedPublisher for Topic {
    async fn publish(&self, key: &str, value: Vec<u8>) -> Result<FeedRecord> {
        self.append(key, value)
    }
}

/// Stable FNV-1a partitioner; the same key always lands on the same partition.
#[must_use]
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME));
    hash % partitions.max(1)
}

/// Registry of named topics sharing a partition count and an optional data directory.
#[derive(Debug)]
pub struct Broker {
    partitions: u32,
    data_dir: Option<PathBuf>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Broker {
    /// In-memory broker.
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            data_dir: None,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Journals every topic under `dir` (created if missing).
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating data dir {}", dir.display()))?;
        self.data_dir = Some(dir);
        Ok(self)
    }

    /// Partition count applied to every topic.
    #[must_use]
    pub const fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Data directory, when journaling is enabled.
    #[must_use]
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Returns the named topic, opening (and replaying) it on first use.
    ///
    /// The cleanup policy is fixed by the first caller.
    pub fn topic(&self, name: &str, cleanup: Cleanup) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(Arc::clone(topic));
        }
        let mut topics = self.topics.write();
        if let Some(topic) = topics.get(name) {
            return Ok(Arc::clone(topic));
        }
        let topic = match &self.data_dir {
            Some(dir) => Topic::open(name, self.partitions, cleanup, dir.join(format!("{name}.jsonl")))?,
            None => Topic::new(name, self.partitions, cleanup),
        };
        let topic = Arc::new(topic);
        topics.insert(name.to_string(), Arc::clone(&topic));
        Ok(topic)
    }

    /// Names of the topics opened so far.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }
}

mod value_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
