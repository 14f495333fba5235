#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines logging shared by the flightcast crates.

use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Per-record detail (predictions, buffered rows).
    Debug,
    /// Lifecycle and model publication events.
    Info,
    /// Dropped input and recoverable anomalies.
    Warn,
    /// Worker faults and shutdown timeouts.
    Error,
}

impl LogLevel {
    /// Upper-case label used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a configured level name is not recognised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown log level '{0}' (expected DEBUG, INFO, WARN or ERROR)")]
pub struct UnknownLevel(pub String);

impl FromStr for LogLevel {
    type Err = UnknownLevel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            _ => Err(UnknownLevel(value.to_string())),
        }
    }
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log (`scoring`, `update`, `runtime`, ...).
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted message name, e.g. `update.snapshot.published`.
    pub message: String,
    /// Structured fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl LogRecord {
    /// Creates a record with no fields.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    /// Copies the fields of a JSON object into the record; other values land under `data`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        match metadata {
            Value::Object(map) => self.metadata.extend(map),
            Value::Null => {}
            other => {
                self.metadata.insert("data".into(), other);
            }
        }
        self
    }
}

enum Sink {
    File { path: PathBuf, writer: Mutex<File> },
    Stderr(Mutex<io::Stderr>),
}

/// Thread-safe JSON-lines logger writing to a file or to stderr.
pub struct JsonLogger {
    sink: Sink,
    min_level: LogLevel,
}

impl fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLogger")
            .field("path", &self.path())
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl JsonLogger {
    /// Creates or opens an append-only log file, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log dir {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            sink: Sink::File {
                path,
                writer: Mutex::new(file),
            },
            min_level: LogLevel::Debug,
        })
    }

    /// Logger writing JSON lines to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            sink: Sink::Stderr(Mutex::new(io::stderr())),
            min_level: LogLevel::Debug,
        }
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Whether a record at `level` would be written.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Writes a record as one JSON line, unless filtered by level.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if !self.enabled(record.level) {
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        match &self.sink {
            Sink::File { writer, .. } => {
                let mut writer = writer.lock();
                writer.write_all(&line)?;
                writer.flush()?;
            }
            Sink::Stderr(stderr) => {
                let mut stderr = stderr.lock();
                stderr.write_all(&line)?;
            }
        }
        Ok(())
    }

    /// Backing file path; `None` for stderr loggers.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            Sink::Stderr(_) => None,
        }
    }
}
