use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flightcast_learning::{
    FeatureCodec, FeatureRecord, OnlineTrainer, ParseError, SerializationError, Telemetry,
    FEATURE_DIM,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_feeds::{FeedPublisher, FeedRecord};
use shared_logging::LogLevel;

use crate::model_table::ModelTable;

/// Prediction for one live record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEvent {
    /// Partition key.
    pub key: String,
    /// Probability the flight is delayed; `None` when no usable model existed.
    pub probability: Option<f64>,
    /// Change-log offset of the model used.
    pub model_version: Option<u64>,
    /// Label carried by the live row.
    pub observed_label: u8,
    /// When the record was scored.
    pub scored_at: DateTime<Utc>,
}

impl PredictionEvent {
    /// Whether the event may leave the pipeline.
    #[must_use]
    pub const fn is_emittable(&self) -> bool {
        self.probability.is_some()
    }
}

/// Result of scoring one raw live row.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    /// A prediction was produced.
    Emitted(PredictionEvent),
    /// Row did not decode; dropped.
    Unparseable(ParseError),
    /// No snapshot for the key; dropped.
    NoModel,
    /// Snapshot bytes did not decode; dropped as if absent.
    CorruptModel(SerializationError),
}

/// Counters kept by a scoring worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoringStats {
    /// Rows seen.
    pub processed: u64,
    /// Predictions emitted.
    pub emitted: u64,
    /// Rows dropped because the key had no model.
    pub no_model: u64,
    /// Rows that failed to decode.
    pub unparseable: u64,
    /// Rows whose model snapshot was corrupt.
    pub corrupt_model: u64,
}

struct CachedModel<T> {
    version: u64,
    model: Result<Arc<T>, SerializationError>,
}

/// Stream-table join of live rows against the replicated model table.
pub struct ScoringPipeline<T> {
    codec: FeatureCodec,
    table: ModelTable,
    cache: HashMap<String, CachedModel<T>>,
    stats: ScoringStats,
    telemetry: Option<Telemetry>,
}

impl<T: OnlineTrainer> ScoringPipeline<T> {
    /// Pipeline reading models from `table`.
    #[must_use]
    pub fn new(codec: FeatureCodec, table: ModelTable) -> Self {
        Self {
            codec,
            table,
            cache: HashMap::new(),
            stats: ScoringStats::default(),
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
    pub const fn stats(&self) -> ScoringStats {
        self.stats
    }

    /// Scores a decoded record; the probability is absent when no usable model exists.
    pub fn predict(&mut self, record: &FeatureRecord) -> PredictionEvent {
        let mut event = PredictionEvent {
            key: record.key().to_string(),
            probability: None,
            model_version: None,
            observed_label: record.label(),
            scored_at: Utc::now(),
        };
        if let Some(Ok((version, model))) = self.model_for(record.key()) {
            event.probability = Some(model.score_probability(record.features()));
            event.model_version = Some(version);
        }
        event
    }

    /// Decodes, joins and scores one raw row.
    pub fn score(&mut self, raw: &str) -> ScoreOutcome {
        self.stats.processed += 1;
        let record = match self.codec.decode(raw) {
            Ok(record) => record,
            Err(err) => {
                self.stats.unparseable += 1;
                self.log(
                    LogLevel::Debug,
                    "scoring.row.unparseable",
                    json!({ "error": err.to_string() }),
                );
                return ScoreOutcome::Unparseable(err);
            }
        };
        match self.model_for(record.key()) {
            None => {
                self.stats.no_model += 1;
                ScoreOutcome::NoModel
            }
            Some(Err(err)) => {
                self.stats.corrupt_model += 1;
                ScoreOutcome::CorruptModel(err)
            }
            Some(Ok(_)) => {
                let event = self.predict(&record);
                self.stats.emitted += 1;
                self.log(
                    LogLevel::Debug,
                    "scoring.prediction",
                    json!({
                        "key": event.key,
                        "probability": event.probability,
                        "model_version": event.model_version,
                    }),
                );
                ScoreOutcome::Emitted(event)
            }
        }
    }

    /// Scores a batch of live feed records and publishes every prediction.
    ///
    /// Records are handled in the order given. Returns the number published.
    pub async fn process_batch(
        &mut self,
        records: &[FeedRecord],
        output: &dyn FeedPublisher,
    ) -> Result<usize> {
        let mut published = 0;
        for record in records {
            let Ok(raw) = record.value_str() else {
                self.stats.processed += 1;
                self.stats.unparseable += 1;
                continue;
            };
            if let ScoreOutcome::Emitted(event) = self.score(raw) {
                let payload = serde_json::to_vec(&event)?;
                output
                    .publish(&event.key, payload)
                    .await
                    .with_context(|| format!("publishing prediction for '{}'", event.key))?;
                published += 1;
            }
        }
        Ok(published)
    }

    fn model_for(&mut self, key: &str) -> Option<Result<(u64, Arc<T>), SerializationError>> {
        let Some(snapshot) = self.table.get(key) else {
            self.cache.remove(key);
            return None;
        };
        let stale = self
            .cache
            .get(key)
            .map_or(true, |cached| cached.version != snapshot.version);
        if stale {
            let model = T::deserialize(&snapshot.weights, FEATURE_DIM).map(Arc::new);
            if let Err(err) = &model {
                self.log(
                    LogLevel::Warn,
                    "scoring.model.corrupt",
                    json!({ "key": key, "version": snapshot.version, "error": err.to_string() }),
                );
            }
            self.cache.insert(
                key.to_string(),
                CachedModel {
                    version: snapshot.version,
                    model,
                },
            );
        }
        self.cache.get(key).map(|cached| {
            cached
                .model
                .as_ref()
                .map(|model| (cached.version, Arc::clone(model)))
                .map_err(Clone::clone)
        })
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
    use crate::model_table::ModelTableReplicator;
    use flightcast_learning::{train_epochs, LogisticRegression, TrainerParams};
    use shared_feeds::{Cleanup, Topic};

    const DELAYED: &str = "JFK,7,12,5,1815,2115,900,75,1";
    const ON_TIME: &str = "JFK,7,12,5,0615,0815,900,-8,0";

    fn trained_bytes() -> Vec<u8> {
        let codec = FeatureCodec::default();
        let records: Vec<_> = (1..=10)
            .flat_map(|day| {
                [
                    codec.decode(&format!("JFK,7,{day},5,1800,2100,900,{},1", 55 + day)).unwrap(),
                    codec.decode(&format!("JFK,7,{day},5,0600,0800,900,-{day},0")).unwrap(),
                ]
            })
            .collect();
        let mut model = LogisticRegression::new(FEATURE_DIM, TrainerParams::default());
        train_epochs(&mut model, &records, 20);
        model.serialize()
    }

    fn fixture() -> (Arc<Topic>, ModelTableReplicator) {
        let changelog = Arc::new(Topic::new("models", 1, Cleanup::Compact { every: 100 }));
        let replicator = ModelTableReplicator::new(Arc::clone(&changelog));
        (changelog, replicator)
    }

    #[test]
    fn keys_without_models_emit_nothing() {
        let (changelog, mut replicator) = fixture();
        changelog.append("JFK", trained_bytes()).unwrap();
        replicator.catch_up();
        let mut pipeline: ScoringPipeline<LogisticRegression> =
            ScoringPipeline::new(FeatureCodec::default(), replicator.table());
        let outcome = pipeline.score("LAX,7,12,5,1815,2115,900,75,1");
        assert_eq!(outcome, ScoreOutcome::NoModel);
        let event = pipeline.predict(&FeatureCodec::default().decode("LAX,7,12,5,1815,2115,900,75,1").unwrap());
        assert!(!event.is_emittable());
        assert_eq!(pipeline.stats().emitted, 0);
    }

    #[test]
    fn scores_with_the_replicated_model() {
        let (changelog, mut replicator) = fixture();
        changelog.append("JFK", trained_bytes()).unwrap();
        replicator.catch_up();
        let mut pipeline: ScoringPipeline<LogisticRegression> =
            ScoringPipeline::new(FeatureCodec::default(), replicator.table());
        let ScoreOutcome::Emitted(delayed) = pipeline.score(DELAYED) else {
            panic!("expected a prediction");
        };
        let ScoreOutcome::Emitted(on_time) = pipeline.score(ON_TIME) else {
            panic!("expected a prediction");
        };
        assert!(delayed.probability.unwrap() > 0.5);
        assert!(on_time.probability.unwrap() < 0.5);
        assert_eq!(delayed.model_version, Some(0));
        assert_eq!(delayed.observed_label, 1);
    }

    #[test]
    fn republishing_identical_bytes_keeps_scores() {
        let (changelog, mut replicator) = fixture();
        let bytes = trained_bytes();
        changelog.append("JFK", bytes.clone()).unwrap();
        replicator.catch_up();
        let mut pipeline: ScoringPipeline<LogisticRegression> =
            ScoringPipeline::new(FeatureCodec::default(), replicator.table());
        let ScoreOutcome::Emitted(before) = pipeline.score(DELAYED) else {
            panic!("expected a prediction");
        };
        changelog.append("JFK", bytes).unwrap();
        replicator.catch_up();
        let ScoreOutcome::Emitted(after) = pipeline.score(DELAYED) else {
            panic!("expected a prediction");
        };
        assert_eq!(
            before.probability.unwrap().to_bits(),
            after.probability.unwrap().to_bits()
        );
        assert_eq!(after.model_version, Some(1));
    }

    #[test]
    fn malformed_rows_and_corrupt_models_are_dropped() {
        let (changelog, mut replicator) = fixture();
        changelog.append("JFK", b"garbage".to_vec()).unwrap();
        replicator.catch_up();
        let mut pipeline: ScoringPipeline<LogisticRegression> =
            ScoringPipeline::new(FeatureCodec::default(), replicator.table());
        assert!(matches!(pipeline.score("abc,,,xyz"), ScoreOutcome::Unparseable(_)));
        assert!(matches!(pipeline.score(DELAYED), ScoreOutcome::CorruptModel(_)));
        assert!(matches!(pipeline.score(DELAYED), ScoreOutcome::CorruptModel(_)));
        let stats = pipeline.stats();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.unparseable, 1);
        assert_eq!(stats.corrupt_model, 2);
        assert_eq!(stats.emitted, 0);
    }

    #[test]
    fn models_of_another_width_count_as_corrupt() {
        let (changelog, mut replicator) = fixture();
        let narrow = LogisticRegression::new(3, TrainerParams::default()).serialize();
        changelog.append("JFK", narrow).unwrap();
        replicator.catch_up();
        let mut pipeline: ScoringPipeline<LogisticRegression> =
            ScoringPipeline::new(FeatureCodec::default(), replicator.table());
        assert!(matches!(
            pipeline.score(DELAYED),
            ScoreOutcome::CorruptModel(SerializationError::DimensionMismatch { found: 3, .. })
        ));
        changelog.append("JFK", trained_bytes()).unwrap();
        replicator.catch_up();
        assert!(matches!(pipeline.score(DELAYED), ScoreOutcome::Emitted(_)));
        assert_eq!(pipeline.stats().corrupt_model, 1);
    }

    #[tokio::test]
    async fn batches_publish_only_emitted_predictions() {
        let (changelog, mut replicator) = fixture();
        changelog.append("JFK", trained_bytes()).unwrap();
        replicator.catch_up();
        let live = Topic::new("raw-airline-data", 1, Cleanup::Retain);
        for row in [DELAYED, "LAX,7,12,5,1815,2115,900,75,1", "abc,,,xyz", ON_TIME] {
            live.append_to(0, "k", row.as_bytes().to_vec()).unwrap();
        }
        let predictions = Topic::new("predictions", 1, Cleanup::Retain);
        let mut pipeline: ScoringPipeline<LogisticRegression> =
            ScoringPipeline::new(FeatureCodec::default(), replicator.table());
        let published = pipeline
            .process_batch(&live.fetch(0, 0, 10), &predictions)
            .await
            .unwrap();
        assert_eq!(published, 2);
        let events: Vec<PredictionEvent> = predictions
            .fetch(0, 0, 10)
            .iter()
            .map(|record| serde_json::from_slice(&record.value).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.key == "JFK"));
        assert_eq!(events[0].observed_label, 1);
        assert_eq!(events[1].observed_label, 0);
    }
}
