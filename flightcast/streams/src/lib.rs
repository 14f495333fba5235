#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::module_name_repetitions)]

//! Flightcast streams: per-key scoring against a replicated model table, fed by online retraining.

/// TOML runtime configuration.
#[path = "../config.rs"]
pub mod config;

/// Runtime error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Bounded per-key record windows.
#[path = "../buffer.rs"]
pub mod buffer;

/// Replicated model table and its change-log replicator.
#[path = "../model_table.rs"]
pub mod model_table;

/// Live-row scoring pipeline.
#[path = "../scoring.rs"]
pub mod scoring;

/// Online model update pipeline.
#[path = "../update.rs"]
pub mod update;

/// File ingestion into topics.
#[path = "../ingest.rs"]
pub mod ingest;

/// Prediction mirroring to JSON lines.
#[path = "../sink.rs"]
pub mod sink;

/// Worker runtime and shutdown.
#[path = "../runtime.rs"]
pub mod runtime;

pub use buffer::{BoundedKeyBuffer, RestoreStats};
pub use config::{StreamsConfig, TopicSettings, UpdateSettings};
pub use error::PipelineError;
pub use ingest::{ingest_file, IngestStats};
pub use model_table::{ApplyOutcome, ModelSnapshot, ModelTable, ModelTableReplicator};
pub use runtime::{owned_partitions, RuntimeTopics, ShutdownReport, StreamsRuntime, WorkerSummary};
pub use scoring::{PredictionEvent, ScoreOutcome, ScoringPipeline, ScoringStats};
pub use sink::PredictionSink;
pub use update::{UpdateOutcome, UpdatePipeline, UpdateStats};
