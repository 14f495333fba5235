//! Cold-start model generation from a flight file.
//!
//! Rows are grouped by origin, sampled, split into train and test portions,
//! trained for a fixed number of epochs and scored against the held-out rows.

use std::path::Path;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    codec::{FeatureCodec, FeatureRecord, FEATURE_DIM},
    dataloader::load_rows_by_key,
    evaluation::{AucEvaluator, EvaluationReport},
    telemetry::Telemetry,
    trainer::{train_epochs, LogisticRegression, OnlineTrainer, TrainerParams},
};

/// Offline training knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    /// Passes over each key's training rows.
    pub epochs: usize,
    /// Largest sample drawn per key.
    pub max_records: usize,
    /// Share of each sample used for training; the remainder is the test set.
    pub train_fraction: f64,
    /// Seed for reproducible sampling; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            max_records: 500,
            train_fraction: 0.20,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Rejects settings that cannot produce a model.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            bail!("training.epochs must be at least 1");
        }
        if self.max_records == 0 {
            bail!("training.max_records must be at least 1");
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            bail!(
                "training.train_fraction must lie strictly between 0 and 1, got {}",
                self.train_fraction
            );
        }
        Ok(())
    }
}

/// Outcome of training one key.
#[derive(Debug, Clone)]
pub struct KeyModel {
    /// Trained model.
    pub trainer: LogisticRegression,
    /// Held-out metrics.
    pub report: EvaluationReport,
    /// Rows used for training.
    pub train_rows: usize,
    /// Rows used for evaluation.
    pub test_rows: usize,
    /// Sampled rows that failed to decode.
    pub parse_failures: usize,
}

/// Draws at most `max_records` distinct rows, in random order.
pub fn sample_rows<'a>(rows: &'a [String], max_records: usize, rng: &mut SmallRng) -> Vec<&'a str> {
    if rows.len() <= max_records {
        let mut all: Vec<&str> = rows.iter().map(String::as_str).collect();
        all.shuffle(rng);
        return all;
    }
    rand::seq::index::sample(rng, rows.len(), max_records)
        .into_iter()
        .map(|idx| rows[idx].as_str())
        .collect()
}

/// Splits `sample` at `fraction` without dropping the boundary row.
///
/// A non-empty sample always keeps at least one training row.
#[must_use]
pub fn split_at_fraction<T>(sample: &[T], fraction: f64) -> (&[T], &[T]) {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let index = (sample.len() as f64 * fraction) as usize;
    let index = index.clamp(usize::from(!sample.is_empty()), sample.len());
    sample.split_at(index)
}

/// Trains one logistic-regression model per key.
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    config: TrainingConfig,
    params: TrainerParams,
    codec: FeatureCodec,
    telemetry: Option<Telemetry>,
}

impl ModelBuilder {
    /// Builder with the given training knobs and default trainer settings.
    #[must_use]
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Overrides the SGD hyper-parameters.
    #[must_use]
    pub const fn with_params(mut self, params: TrainerParams) -> Self {
        self.params = params;
        self
    }

    /// Overrides the row codec.
    #[must_use]
    pub const fn with_codec(mut self, codec: FeatureCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Training knobs in effect.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Trains a model per key found in `path`.
    pub fn train_file(&self, path: impl AsRef<Path>) -> Result<IndexMap<String, KeyModel>> {
        self.config.validate()?;
        self.params.validate()?;
        let path = path.as_ref();
        let keyed = load_rows_by_key(path, &self.codec)
            .with_context(|| format!("loading training rows from {}", path.display()))?;
        self.log(
            LogLevel::Info,
            "offline.load.complete",
            json!({
                "path": path.display().to_string(),
                "keys": keyed.rows.len(),
                "rows": keyed.total(),
                "skipped": keyed.skipped,
            }),
        );
        let mut rng = match self.config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let mut models = IndexMap::with_capacity(keyed.rows.len());
        for (key, rows) in &keyed.rows {
            let sample = sample_rows(rows, self.config.max_records, &mut rng);
            let model = self.train_key(key, &sample);
            self.log(
                LogLevel::Info,
                "offline.key.trained",
                json!({
                    "key": key,
                    "train_rows": model.train_rows,
                    "test_rows": model.test_rows,
                    "parse_failures": model.parse_failures,
                    "auc": model.report.auc,
                    "accuracy": model.report.accuracy,
                }),
            );
            models.insert(key.clone(), model);
        }
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.event(
                "offline.models.built",
                json!({ "keys": models.len(), "path": path.display().to_string() }),
            );
        }
        Ok(models)
    }

    /// Trains per key and returns the serialized snapshots.
    pub fn build_models(&self, path: impl AsRef<Path>) -> Result<IndexMap<String, Vec<u8>>> {
        Ok(self
            .train_file(path)?
            .into_iter()
            .map(|(key, model)| (key, model.trainer.serialize()))
            .collect())
    }

    /// Trains one model on every decodable row and returns its snapshot.
    #[must_use]
    pub fn train_rows<S: AsRef<str>>(&self, rows: &[S]) -> Vec<u8> {
        let (records, _) = self.decode_all(rows.iter().map(AsRef::as_ref));
        self.fit(&records).serialize()
    }

    fn train_key(&self, key: &str, sample: &[&str]) -> KeyModel {
        let (train, test) = split_at_fraction(sample, self.config.train_fraction);
        let (train_records, train_failures) = self.decode_all(train.iter().copied());
        let (test_records, test_failures) = self.decode_all(test.iter().copied());
        if train_records.is_empty() {
            self.log(
                LogLevel::Warn,
                "offline.key.untrained",
                json!({ "key": key, "sampled": sample.len() }),
            );
        }
        let trainer = self.fit(&train_records);
        let mut evaluator = AucEvaluator::new(0.5);
        for record in &test_records {
            evaluator.add(record.label(), trainer.score_probability(record.features()));
        }
        KeyModel {
            trainer,
            report: evaluator.report(),
            train_rows: train_records.len(),
            test_rows: test_records.len(),
            parse_failures: train_failures + test_failures,
        }
    }

    fn fit(&self, records: &[FeatureRecord]) -> LogisticRegression {
        let mut trainer = LogisticRegression::new(FEATURE_DIM, self.params);
        train_epochs(&mut trainer, records, self.config.epochs);
        trainer
    }

    fn decode_all<'a>(&self, rows: impl Iterator<Item = &'a str>) -> (Vec<FeatureRecord>, usize) {
        let mut failures = 0;
        let records = rows
            .filter_map(|row| match self.codec.decode(row) {
                Ok(record) => Some(record),
                Err(err) => {
                    failures += 1;
                    self.log(
                        LogLevel::Debug,
                        "offline.row.skipped",
                        json!({ "error": err.to_string() }),
                    );
                    None
                }
            })
            .collect();
        (records, failures)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, message, metadata);
        }
    }
}

/// Trains every key in `path` with default settings.
pub fn train_file(path: impl AsRef<Path>) -> Result<IndexMap<String, LogisticRegression>> {
    Ok(ModelBuilder::default()
        .train_file(path)?
        .into_iter()
        .map(|(key, model)| (key, model.trainer))
        .collect())
}

/// Serialized per-key models for `path` with default settings.
pub fn build_models(path: impl AsRef<Path>) -> Result<IndexMap<String, Vec<u8>>> {
    ModelBuilder::default().build_models(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;
    use tempfile::tempdir;

    fn flights() -> String {
        let mut out = String::new();
        for idx in 0..60 {
            let day = idx % 28 + 1;
            writeln!(out, "JFK,7,{day},5,1800,2100,900,{},1", 50 + idx).unwrap();
            writeln!(out, "JFK,7,{day},5,0600,0800,900,{},0", -5 - idx % 10).unwrap();
        }
        for idx in 0..5 {
            writeln!(out, "BOS,3,{},2,1200,1400,200,0,{}", idx + 1, idx % 2).unwrap();
        }
        out.push_str("BOS,broken\n");
        out
    }

    #[test]
    fn split_keeps_every_row() {
        let rows: Vec<u32> = (0..10).collect();
        let (train, test) = split_at_fraction(&rows, 0.2);
        assert_eq!(train, &[0, 1]);
        assert_eq!(test.len(), 8);
        assert_eq!(test[0], 2);

        let (train, test) = split_at_fraction(&rows[..3], 0.2);
        assert_eq!((train.len(), test.len()), (1, 2));
        let empty: [u32; 0] = [];
        let (train, test) = split_at_fraction(&empty, 0.2);
        assert!(train.is_empty() && test.is_empty());
    }

    #[test]
    fn sampling_is_bounded_and_distinct() {
        let rows: Vec<String> = (0..50).map(|idx| format!("row-{idx}")).collect();
        let mut rng = SmallRng::seed_from_u64(7);
        let sample = sample_rows(&rows, 20, &mut rng);
        assert_eq!(sample.len(), 20);
        let mut unique = sample.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 20);
        assert_eq!(sample_rows(&rows[..5], 20, &mut rng).len(), 5);
    }

    #[test]
    fn trains_a_model_per_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flights.csv");
        std::fs::write(&path, flights()).unwrap();
        let builder = ModelBuilder::new(TrainingConfig {
            train_fraction: 0.5,
            seed: Some(3),
            ..TrainingConfig::default()
        });
        let models = builder.train_file(&path).unwrap();
        assert_eq!(models.keys().collect::<Vec<_>>(), vec!["JFK", "BOS"]);
        let jfk = &models["JFK"];
        assert_eq!(jfk.train_rows + jfk.test_rows, 120);
        assert!(jfk.report.auc.unwrap() > 0.9);
        let bos = &models["BOS"];
        assert_eq!(bos.train_rows + bos.test_rows + bos.parse_failures, 6);
        assert_eq!(bos.parse_failures, 1);
    }

    #[test]
    fn seeded_builds_are_reproducible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flights.csv");
        std::fs::write(&path, flights()).unwrap();
        let config = TrainingConfig {
            max_records: 40,
            seed: Some(11),
            ..TrainingConfig::default()
        };
        let first = ModelBuilder::new(config).build_models(&path).unwrap();
        let second = ModelBuilder::new(config).build_models(&path).unwrap();
        assert_eq!(first, second);
        let restored = LogisticRegression::deserialize(&first["JFK"], FEATURE_DIM).unwrap();
        assert_eq!(restored.dimension(), FEATURE_DIM);
    }

    #[test]
    fn train_rows_skips_malformed_input() {
        let rows = ["JFK,7,1,5,1800,2100,900,60,1", "abc,,,xyz", "JFK,7,2,5,0600,0800,900,-5,0"];
        let bytes = ModelBuilder::default().train_rows(&rows);
        let model = LogisticRegression::deserialize(&bytes, FEATURE_DIM).unwrap();
        assert_eq!(model.steps(), 40);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = TrainingConfig {
            train_fraction: 1.0,
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ModelBuilder::new(config).train_file("missing.csv").is_err());
    }
}
