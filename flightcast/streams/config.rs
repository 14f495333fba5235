use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use flightcast_learning::{TrainerParams, TrainingConfig};
use serde::Deserialize;
use shared_logging::LogLevel;

/// Runtime configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamsConfig {
    /// Name reported in logs and telemetry.
    #[serde(default = "default_application_id")]
    pub application_id: String,
    /// Partitions per topic; live and training topics are co-partitioned.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Parallel workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Time allowed for workers to finish after shutdown is requested.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Directory journaling every topic; in-memory when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// JSON-lines log file; stderr when absent.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Minimum level written to the log.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Topic names and retention.
    #[serde(default)]
    pub topics: TopicSettings,
    /// Update pipeline settings.
    #[serde(default)]
    pub update: UpdateSettings,
    /// Offline builder settings.
    #[serde(default)]
    pub training: TrainingConfig,
    /// SGD hyper-parameters shared by both training paths.
    #[serde(default)]
    pub trainer: TrainerParams,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            application_id: default_application_id(),
            partitions: default_partitions(),
            workers: default_workers(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            data_dir: None,
            log_path: None,
            log_level: default_log_level(),
            topics: TopicSettings::default(),
            update: UpdateSettings::default(),
            training: TrainingConfig::default(),
            trainer: TrainerParams::default(),
        }
    }
}

impl StreamsConfig {
    /// Loads and validates a TOML file; relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading streams config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for slot in [&mut config.data_dir, &mut config.log_path] {
            if let Some(candidate) = slot.as_mut() {
                if candidate.is_relative() {
                    *candidate = base.join(&*candidate);
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            bail!("partitions must be at least 1");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.update.buffer_capacity == 0 {
            bail!("update.buffer_capacity must be at least 1");
        }
        if self.update.min_history > self.update.buffer_capacity {
            bail!(
                "update.min_history ({}) exceeds update.buffer_capacity ({})",
                self.update.min_history,
                self.update.buffer_capacity
            );
        }
        if self.update.publish_every == 0 {
            bail!("update.publish_every must be at least 1");
        }
        let names = [
            &self.topics.training,
            &self.topics.live,
            &self.topics.models,
            &self.topics.predictions,
        ];
        if names.iter().any(|name| name.trim().is_empty()) {
            bail!("topic names must not be empty");
        }
        for (idx, name) in names.iter().enumerate() {
            if names[..idx].contains(name) {
                bail!("topic '{name}' is configured twice");
            }
        }
        self.training.validate()?;
        self.trainer.validate()?;
        self.log_level()?;
        Ok(())
    }

    /// Parsed log level.
    pub fn log_level(&self) -> Result<LogLevel> {
        self.log_level
            .parse()
            .with_context(|| format!("invalid log_level '{}'", self.log_level))
    }

    /// Shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Topic names and retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicSettings {
    /// Labelled rows feeding the update pipeline.
    #[serde(default = "default_training_topic")]
    pub training: String,
    /// Live rows feeding the scoring pipeline.
    #[serde(default = "default_live_topic")]
    pub live: String,
    /// Compacted model change-log.
    #[serde(default = "default_models_topic")]
    pub models: String,
    /// Prediction output.
    #[serde(default = "default_predictions_topic")]
    pub predictions: String,
    /// Records kept per partition of the training, live and prediction topics; 0 keeps everything.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Change-log appends between compactions.
    #[serde(default = "default_compact_every")]
    pub compact_every: usize,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            training: default_training_topic(),
            live: default_live_topic(),
            models: default_models_topic(),
            predictions: default_predictions_topic(),
            retention: default_retention(),
            compact_every: default_compact_every(),
        }
    }
}

/// Update pipeline settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateSettings {
    /// Records kept per key.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Window size required before a key without a model is warm-started.
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    /// Updates between snapshot publications.
    #[serde(default = "default_publish_every")]
    pub publish_every: usize,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            min_history: default_min_history(),
            publish_every: default_publish_every(),
        }
    }
}

fn default_application_id() -> String {
    "streams-online-inferencing".into()
}

const fn default_partitions() -> u32 {
    4
}

const fn default_workers() -> usize {
    2
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "INFO".into()
}

fn default_training_topic() -> String {
    "ml-data-input".into()
}

fn default_live_topic() -> String {
    "raw-airline-data".into()
}

fn default_models_topic() -> String {
    "onlineRegression-by-airport".into()
}

fn default_predictions_topic() -> String {
    "predictions".into()
}

const fn default_retention() -> usize {
    100_000
}

const fn default_compact_every() -> usize {
    1_024
}

const fn default_buffer_capacity() -> usize {
    250
}

const fn default_min_history() -> usize {
    20
}

const fn default_publish_every() -> usize {
    1
}
