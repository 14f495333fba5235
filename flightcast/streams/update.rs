use std::collections::HashMap;

use anyhow::{Context, Result};
use flightcast_learning::{
    train_epochs, FeatureCodec, FeatureRecord, OnlineTrainer, Telemetry, FEATURE_DIM,
};
use serde::Serialize;
use serde_json::json;
use shared_feeds::{FeedPublisher, FeedRecord, TopicCursor};
use shared_logging::LogLevel;

use crate::{
    buffer::{BoundedKeyBuffer, RestoreStats},
    config::UpdateSettings,
    model_table::ModelTable,
};

/// What one training record caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Row did not decode; dropped.
    Unparseable,
    /// Stored in the window; the key has no trainer yet.
    Buffered {
        /// Window length after the insert.
        window: usize,
    },
    /// Trainer updated; no snapshot due yet.
    Trained,
    /// Trainer updated and a snapshot is ready for the change-log.
    Snapshot(Vec<u8>),
}

/// Counters kept by an update worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateStats {
    /// Rows seen.
    pub processed: u64,
    /// Rows that failed to decode.
    pub unparseable: u64,
    /// Incremental updates applied.
    pub updates: u64,
    /// Keys warm-started from their window.
    pub warm_starts: u64,
    /// Keys seeded from a replicated snapshot.
    pub seeded: u64,
    /// Snapshots produced.
    pub snapshots: u64,
}

struct KeyTrainer<T> {
    trainer: T,
    pending: usize,
}

/// Online retraining of the keys owned by one worker.
///
/// Each key has one trainer. A key that has none is seeded from the model
/// table when a snapshot exists there, otherwise it waits until its window
/// holds `min_history` rows and is warm-started over the whole window.
pub struct UpdatePipeline<T> {
    codec: FeatureCodec,
    settings: UpdateSettings,
    epochs: usize,
    prototype: T,
    buffer: BoundedKeyBuffer,
    trainers: HashMap<String, KeyTrainer<T>>,
    table: ModelTable,
    stats: UpdateStats,
    telemetry: Option<Telemetry>,
}

impl<T: OnlineTrainer + Clone> UpdatePipeline<T> {
    /// Pipeline cloning `prototype` for every new key.
    #[must_use]
    pub fn new(
        prototype: T,
        codec: FeatureCodec,
        settings: UpdateSettings,
        epochs: usize,
        table: ModelTable,
    ) -> Self {
        Self {
            codec,
            settings,
            epochs: epochs.max(1),
            prototype,
            buffer: BoundedKeyBuffer::new(settings.buffer_capacity),
            trainers: HashMap::new(),
            table,
            stats: UpdateStats::default(),
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> UpdateStats {
        self.stats
    }

    /// Per-key history.
    #[must_use]
    pub const fn buffer(&self) -> &BoundedKeyBuffer {
        &self.buffer
    }

    /// Current trainer for `key`.
    #[must_use]
    pub fn trainer(&self, key: &str) -> Option<&T> {
        self.trainers.get(key).map(|state| &state.trainer)
    }

    /// Refills windows from the training topic; see [`BoundedKeyBuffer::restore`].
    pub fn restore(&mut self, cursor: &mut TopicCursor) -> RestoreStats {
        let stats = self.buffer.restore(cursor, &self.codec);
        self.log(
            LogLevel::Info,
            "update.buffer.restored",
            json!({ "restored": stats.restored, "skipped": stats.skipped }),
        );
        stats
    }

    /// Decodes and applies one raw training row.
    pub fn ingest(&mut self, raw: &str) -> UpdateOutcome {
        self.stats.processed += 1;
        match self.codec.decode(raw) {
            Ok(record) => self.apply(record),
            Err(err) => {
                self.stats.unparseable += 1;
                self.log(
                    LogLevel::Debug,
                    "update.row.unparseable",
                    json!({ "error": err.to_string() }),
                );
                UpdateOutcome::Unparseable
            }
        }
    }

    /// Buffers `record` and trains its key.
    pub fn apply(&mut self, record: FeatureRecord) -> UpdateOutcome {
        let key = record.key().to_string();
        let label = record.label();
        let features = *record.features();
        let window = self.buffer.append(record);
        if let Some(state) = self.trainers.get_mut(&key) {
            state.trainer.train(label, &features);
            state.pending += 1;
            self.stats.updates += 1;
            return self.maybe_snapshot(&key);
        }
        if let Some(trainer) = self.seed_from_table(&key) {
            let mut state = KeyTrainer { trainer, pending: 1 };
            state.trainer.train(label, &features);
            self.trainers.insert(key.clone(), state);
            self.stats.seeded += 1;
            self.stats.updates += 1;
            return self.maybe_snapshot(&key);
        }
        if window < self.settings.min_history {
            return UpdateOutcome::Buffered { window };
        }
        let mut trainer = self.prototype.clone();
        train_epochs(&mut trainer, &self.buffer.snapshot(&key), self.epochs);
        self.log(
            LogLevel::Info,
            "update.key.warm_started",
            json!({ "key": key, "window": window, "epochs": self.epochs }),
        );
        self.stats.warm_starts += 1;
        self.stats.snapshots += 1;
        let bytes = trainer.serialize();
        self.trainers.insert(key, KeyTrainer { trainer, pending: 0 });
        UpdateOutcome::Snapshot(bytes)
    }

    /// Applies a batch of training feed records and publishes due snapshots.
    ///
    /// Returns the number of snapshots published.
    pub async fn process_batch(
        &mut self,
        records: &[FeedRecord],
        changelog: &dyn FeedPublisher,
    ) -> Result<usize> {
        let mut published = 0;
        for record in records {
            let outcome = match record.value_str() {
                Ok(raw) => self.ingest(raw),
                Err(_) => {
                    self.stats.processed += 1;
                    self.stats.unparseable += 1;
                    UpdateOutcome::Unparseable
                }
            };
            if let UpdateOutcome::Snapshot(bytes) = outcome {
                let key = self.codec.key_of(record.value_str()?)?.to_string();
                let size = bytes.len();
                let stored = changelog
                    .publish(&key, bytes)
                    .await
                    .with_context(|| format!("publishing snapshot for '{key}'"))?;
                self.log(
                    LogLevel::Debug,
                    "update.snapshot.published",
                    json!({ "key": key, "version": stored.offset, "bytes": size }),
                );
                published += 1;
            }
        }
        Ok(published)
    }

    fn seed_from_table(&self, key: &str) -> Option<T> {
        let snapshot = self.table.get(key)?;
        match T::deserialize(&snapshot.weights, FEATURE_DIM) {
            Ok(trainer) => {
                self.log(
                    LogLevel::Info,
                    "update.key.seeded",
                    json!({ "key": key, "version": snapshot.version }),
                );
                Some(trainer)
            }
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "update.seed.corrupt",
                    json!({ "key": key, "version": snapshot.version, "error": err.to_string() }),
                );
                None
            }
        }
    }

    fn maybe_snapshot(&mut self, key: &str) -> UpdateOutcome {
        let Some(state) = self.trainers.get_mut(key) else {
            return UpdateOutcome::Trained;
        };
        if state.pending < self.settings.publish_every.max(1) {
            return UpdateOutcome::Trained;
        }
        state.pending = 0;
        self.stats.snapshots += 1;
        UpdateOutcome::Snapshot(state.trainer.serialize())
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
    use std::sync::Arc;

    use crate::model_table::ModelTableReplicator;
    use flightcast_learning::{LogisticRegression, TrainerParams};
    use shared_feeds::{Cleanup, Topic};

    fn settings(min_history: usize, publish_every: usize) -> UpdateSettings {
        UpdateSettings {
            buffer_capacity: 5,
            min_history,
            publish_every,
        }
    }

    fn pipeline(table: ModelTable, min_history: usize, publish_every: usize) -> UpdatePipeline<LogisticRegression> {
        UpdatePipeline::new(
            LogisticRegression::new(FEATURE_DIM, TrainerParams::default()),
            FeatureCodec::default(),
            settings(min_history, publish_every),
            3,
            table,
        )
    }

    fn row(key: &str, day: u32) -> String {
        format!("{key},7,{day},5,1800,2100,900,{},{}", 30 + day, day % 2)
    }

    #[test]
    fn warm_start_waits_for_history() {
        let mut pipeline = pipeline(ModelTable::default(), 3, 1);
        assert_eq!(pipeline.ingest(&row("JFK", 1)), UpdateOutcome::Buffered { window: 1 });
        assert_eq!(pipeline.ingest(&row("JFK", 2)), UpdateOutcome::Buffered { window: 2 });
        let UpdateOutcome::Snapshot(bytes) = pipeline.ingest(&row("JFK", 3)) else {
            panic!("warm start should publish");
        };
        let model = LogisticRegression::deserialize(&bytes, FEATURE_DIM).unwrap();
        assert_eq!(model.steps(), 9);
        assert!(matches!(pipeline.ingest(&row("JFK", 4)), UpdateOutcome::Snapshot(_)));
        assert_eq!(pipeline.trainer("JFK").unwrap().steps(), 10);
        assert_eq!(pipeline.stats().warm_starts, 1);
    }

    #[test]
    fn publishes_every_nth_update() {
        let mut pipeline = pipeline(ModelTable::default(), 1, 3);
        assert!(matches!(pipeline.ingest(&row("ORD", 1)), UpdateOutcome::Snapshot(_)));
        assert_eq!(pipeline.ingest(&row("ORD", 2)), UpdateOutcome::Trained);
        assert_eq!(pipeline.ingest(&row("ORD", 3)), UpdateOutcome::Trained);
        assert!(matches!(pipeline.ingest(&row("ORD", 4)), UpdateOutcome::Snapshot(_)));
        assert_eq!(pipeline.stats().snapshots, 2);
    }

    #[test]
    fn keys_are_seeded_from_the_model_table() {
        let changelog = Arc::new(Topic::new("models", 1, Cleanup::Compact { every: 100 }));
        let mut seed = LogisticRegression::new(FEATURE_DIM, TrainerParams::default());
        seed.train(1, &[1.0; FEATURE_DIM]);
        changelog.append("SFO", seed.serialize()).unwrap();
        let mut replicator = ModelTableReplicator::new(Arc::clone(&changelog));
        replicator.catch_up();
        let mut pipeline = pipeline(replicator.table(), 5, 1);
        assert!(matches!(pipeline.ingest(&row("SFO", 1)), UpdateOutcome::Snapshot(_)));
        assert_eq!(pipeline.trainer("SFO").unwrap().steps(), 2);
        assert_eq!(pipeline.stats().seeded, 1);
    }

    #[test]
    fn snapshots_of_another_width_do_not_seed() {
        let changelog = Arc::new(Topic::new("models", 1, Cleanup::Compact { every: 100 }));
        changelog
            .append("SFO", LogisticRegression::new(3, TrainerParams::default()).serialize())
            .unwrap();
        let mut replicator = ModelTableReplicator::new(Arc::clone(&changelog));
        replicator.catch_up();
        let mut pipeline = pipeline(replicator.table(), 2, 1);
        assert_eq!(pipeline.ingest(&row("SFO", 1)), UpdateOutcome::Buffered { window: 1 });
        assert!(matches!(pipeline.ingest(&row("SFO", 2)), UpdateOutcome::Snapshot(_)));
        assert_eq!(pipeline.trainer("SFO").unwrap().dimension(), FEATURE_DIM);
        assert_eq!(pipeline.stats().seeded, 0);
    }

    #[test]
    fn bad_rows_only_count() {
        let mut pipeline = pipeline(ModelTable::default(), 1, 1);
        assert_eq!(pipeline.ingest("abc,,,xyz"), UpdateOutcome::Unparseable);
        assert!(pipeline.buffer().is_empty());
        assert_eq!(pipeline.stats().unparseable, 1);
    }

    #[tokio::test]
    async fn snapshots_land_in_the_changelog() {
        let training = Topic::new("ml-data-input", 1, Cleanup::Retain);
        for day in 1..=4 {
            training
                .append_to(0, "BOS", row("BOS", day).into_bytes())
                .unwrap();
        }
        let changelog = Topic::new("models", 1, Cleanup::Compact { every: 100 });
        let mut pipeline = pipeline(ModelTable::default(), 2, 1);
        let published = pipeline
            .process_batch(&training.fetch(0, 0, 10), &changelog)
            .await
            .unwrap();
        assert_eq!(published, 3);
        let records = changelog.fetch(0, 0, 10);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|record| record.key == "BOS"));
        let latest = LogisticRegression::deserialize(&records[2].value, FEATURE_DIM).unwrap();
        assert_eq!(&latest, pipeline.trainer("BOS").unwrap());
    }
}
