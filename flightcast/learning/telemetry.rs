use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_feeds::FeedPublisher;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle};
use uuid::Uuid;

/// Telemetry event published to the feeds layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Unique identifier.
    pub id: String,
    /// Component producing the event.
    pub source: String,
    /// Dotted event type, e.g. `update.snapshot.published`.
    pub event_type: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event fields.
    #[serde(default)]
    pub payload: Value,
}

/// Builder configuring where logs and events go.
pub struct TelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    stderr: bool,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn FeedPublisher>>,
}

impl TelemetryBuilder {
    /// Creates a builder for `module`; nothing is written until a sink is set.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            stderr: false,
            min_level: LogLevel::Info,
            event_publisher: None,
        }
    }

    /// Writes JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Writes JSON lines to stderr when no log path is configured.
    #[must_use]
    pub const fn stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    /// Minimum level written to the log.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Publishes telemetry events through `publisher`.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn FeedPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<Telemetry> {
        let logger = match (self.log_path, self.stderr) {
            (Some(path), _) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            (None, true) => Some(JsonLogger::stderr().with_min_level(self.min_level)),
            (None, false) => None,
        };
        let event = self
            .event_publisher
            .map(|publisher| Arc::new(EventHandle { publisher }));
        Ok(Telemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger: logger.map(Arc::new),
                event,
            }),
        })
    }
}

/// Cloneable handle shared by every pipeline component.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("module", &self.inner.module)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<Arc<JsonLogger>>,
    event: Option<Arc<EventHandle>>,
}

struct EventHandle {
    publisher: Arc<dyn FeedPublisher>,
}

impl EventHandle {
    fn publish(&self, key: String, payload: Vec<u8>) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(&key, payload).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            Builder::new_current_thread()
                .build()?
                .block_on(self.publisher.publish(&key, payload))
                .map(|_| ())
        }
    }
}

impl Telemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> TelemetryBuilder {
        TelemetryBuilder::new(module)
    }

    /// Handle sharing this one's sinks under a different module label.
    #[must_use]
    pub fn scoped(&self, module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                logger: self.inner.logger.clone(),
                event: self.inner.event.clone(),
            }),
        }
    }

    /// Module label attached to records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Writes a structured log record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            if logger.enabled(level) {
                let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
                logger.log(&record)?;
            }
        }
        Ok(())
    }

    /// Publishes a telemetry event.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            let event = TelemetryEvent {
                id: format!("evt-{}", Uuid::new_v4()),
                source: self.inner.module.clone(),
                event_type: event_type.into(),
                timestamp: Utc::now(),
                payload,
            };
            handle.publish(self.inner.module.clone(), serde_json::to_vec(&event)?)?;
        }
        Ok(())
    }
}
