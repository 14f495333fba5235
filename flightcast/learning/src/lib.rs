#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::module_name_repetitions)]

//! Flightcast learning stack: row codec, online trainer, evaluation and offline model builder.

/// Delimited flight row decoding.
#[path = "../codec.rs"]
pub mod codec;

/// Online trainer trait and logistic-regression implementation.
#[path = "../trainer.rs"]
pub mod trainer;

/// Held-out evaluation metrics.
#[path = "../evaluation.rs"]
pub mod evaluation;

/// Flight file loading.
#[path = "../dataloader.rs"]
pub mod dataloader;

/// Offline per-key model builder.
#[path = "../offline.rs"]
pub mod offline;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use codec::{FeatureCodec, FeatureRecord, ParseError, COLUMN_COUNT, FEATURE_DIM};
pub use dataloader::{load_rows_by_key, DataLoaderError, KeyedRows};
pub use evaluation::{AucEvaluator, EvaluationReport};
pub use offline::{build_models, train_file, KeyModel, ModelBuilder, TrainingConfig};
pub use telemetry::{Telemetry, TelemetryBuilder, TelemetryEvent};
pub use trainer::{train_epochs, LogisticRegression, OnlineTrainer, SerializationError, TrainerParams};
