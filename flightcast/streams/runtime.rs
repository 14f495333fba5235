//! Topic wiring, worker assignment, replication and orderly shutdown.

use std::{any::Any, future::Future, path::Path, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use flightcast_learning::{FeatureCodec, LogisticRegression, OnlineTrainer, Telemetry, FEATURE_DIM};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared_feeds::{Broker, Cleanup, Topic, TopicCursor};
use shared_logging::LogLevel;
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
    time::Instant,
};

use crate::{
    config::{StreamsConfig, TopicSettings},
    error::PipelineError,
    model_table::{ModelTable, ModelTableReplicator},
    scoring::{ScoringPipeline, ScoringStats},
    sink::PredictionSink,
    update::{UpdatePipeline, UpdateStats},
};

const POLL_BATCH: usize = 128;
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// The four pipeline topics.
#[derive(Debug, Clone)]
pub struct RuntimeTopics {
    /// Labelled rows consumed by the update pipeline.
    pub training: Arc<Topic>,
    /// Live rows consumed by the scoring pipeline.
    pub live: Arc<Topic>,
    /// Compacted model change-log.
    pub models: Arc<Topic>,
    /// Prediction output.
    pub predictions: Arc<Topic>,
}

impl RuntimeTopics {
    /// Opens (or creates) every topic on `broker`.
    pub fn open(broker: &Broker, settings: &TopicSettings) -> Result<Self> {
        let retained = match settings.retention {
            0 => Cleanup::Retain,
            max_records => Cleanup::Delete { max_records },
        };
        Ok(Self {
            training: broker.topic(&settings.training, retained)?,
            live: broker.topic(&settings.live, retained)?,
            models: broker.topic(
                &settings.models,
                Cleanup::Compact {
                    every: settings.compact_every,
                },
            )?,
            predictions: broker.topic(&settings.predictions, retained)?,
        })
    }
}

/// Partitions worker `worker` owns: every `p` with `p % workers == worker`.
#[must_use]
pub fn owned_partitions(worker: usize, workers: usize, partitions: u32) -> Vec<u32> {
    let workers = workers.max(1);
    (0..partitions)
        .filter(|partition| *partition as usize % workers == worker)
        .collect()
}

/// Final counters of a worker that stopped cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    /// Worker index.
    pub worker: usize,
    /// Partitions it owned.
    pub partitions: Vec<u32>,
    /// Scoring counters.
    pub scoring: ScoringStats,
    /// Update counters.
    pub update: UpdateStats,
}

/// What happened during shutdown.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Workers that stopped cleanly.
    pub summaries: Vec<WorkerSummary>,
    /// Faults seen during the run, plus a timeout if the grace period ran out.
    pub faults: Vec<PipelineError>,
}

struct Worker<T> {
    id: usize,
    partitions: Vec<u32>,
    scoring: ScoringPipeline<T>,
    update: UpdatePipeline<T>,
    live: TopicCursor,
    training: TopicCursor,
    models: Arc<Topic>,
    predictions: Arc<Topic>,
    telemetry: Option<Telemetry>,
}

impl<T> Worker<T>
where
    T: OnlineTrainer + Clone + Send + Sync + 'static,
{
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerSummary> {
        let mut live_changes = self.live.topic().subscribe();
        let mut training_changes = self.training.topic().subscribe();
        self.log(
            LogLevel::Info,
            "runtime.worker.started",
            json!({ "worker": self.id, "partitions": self.partitions }),
        );
        while !*shutdown.borrow() {
            live_changes.borrow_and_update();
            training_changes.borrow_and_update();
            let training = self.training.poll(POLL_BATCH);
            self.update.process_batch(&training, &*self.models).await?;
            let live = self.live.poll(POLL_BATCH);
            self.scoring.process_batch(&live, &*self.predictions).await?;
            if !training.is_empty() || !live.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                changed = live_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = training_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                stopped = shutdown.changed() => {
                    if stopped.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(IDLE_WAIT) => {}
            }
        }
        let summary = WorkerSummary {
            worker: self.id,
            partitions: self.partitions,
            scoring: self.scoring.stats(),
            update: self.update.stats(),
        };
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(
                LogLevel::Info,
                "runtime.worker.stopped",
                json!({ "worker": summary.worker, "scoring": summary.scoring, "update": summary.update }),
            );
        }
        Ok(summary)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, message, metadata);
        }
    }
}

struct TaskHandle {
    abort: AbortHandle,
    supervisor: JoinHandle<()>,
}

/// Running pipelines of one process.
pub struct StreamsRuntime {
    config: StreamsConfig,
    topics: RuntimeTopics,
    table: ModelTable,
    telemetry: Option<Telemetry>,
    worker_shutdown: watch::Sender<bool>,
    aux_shutdown: watch::Sender<bool>,
    workers: Vec<TaskHandle>,
    auxiliary: Vec<TaskHandle>,
    faults: Arc<Mutex<Vec<PipelineError>>>,
    summaries: Arc<Mutex<Vec<WorkerSummary>>>,
}

impl std::fmt::Debug for StreamsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamsRuntime")
            .field("application_id", &self.config.application_id)
            .field("workers", &self.workers.len())
            .field("models", &self.table.len())
            .finish_non_exhaustive()
    }
}

impl StreamsRuntime {
    /// Starts the pipelines with the logistic-regression trainer.
    pub async fn start(
        config: StreamsConfig,
        broker: &Broker,
        telemetry: Option<Telemetry>,
    ) -> Result<Self> {
        let prototype = LogisticRegression::new(FEATURE_DIM, config.trainer);
        Self::start_with(config, broker, prototype, telemetry).await
    }

    /// Starts the pipelines, cloning `prototype` for every key that needs a fresh trainer.
    ///
    /// The model table is caught up to the change-log before any worker
    /// starts; each worker refills its windows from the training topic and
    /// then consumes both topics from their current end.
    pub async fn start_with<T>(
        config: StreamsConfig,
        broker: &Broker,
        prototype: T,
        telemetry: Option<Telemetry>,
    ) -> Result<Self>
    where
        T: OnlineTrainer + Clone + Send + Sync + 'static,
    {
        config.validate()?;
        if broker.partitions() != config.partitions {
            bail!(
                "broker has {} partitions but the configuration asks for {}",
                broker.partitions(),
                config.partitions
            );
        }
        let topics = RuntimeTopics::open(broker, &config.topics)?;
        let codec = FeatureCodec::default();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let summaries = Arc::new(Mutex::new(Vec::new()));
        let (worker_shutdown, worker_rx) = watch::channel(false);
        let (aux_shutdown, aux_rx) = watch::channel(false);

        let mut replicator = ModelTableReplicator::new(Arc::clone(&topics.models));
        if let Some(telemetry) = &telemetry {
            replicator = replicator.with_telemetry(telemetry.scoped("model_table"));
        }
        replicator.bootstrap();
        let table = replicator.table();
        let auxiliary = vec![spawn_supervised(
            0,
            "replicator",
            async move {
                replicator.run(aux_rx).await;
                Ok(())
            },
            Arc::clone(&faults),
            telemetry.clone(),
            |()| {},
        )];

        let mut workers = Vec::new();
        for id in 0..config.workers {
            let partitions = owned_partitions(id, config.workers, config.partitions);
            if partitions.is_empty() {
                log(
                    telemetry.as_ref(),
                    LogLevel::Warn,
                    "runtime.worker.idle",
                    json!({ "worker": id, "partitions": config.partitions }),
                );
                continue;
            }
            let scoped = telemetry
                .as_ref()
                .map(|telemetry| telemetry.scoped(format!("worker-{id}")));
            let mut update = UpdatePipeline::new(
                prototype.clone(),
                codec,
                config.update,
                config.training.epochs,
                table.clone(),
            );
            let mut scoring = ScoringPipeline::new(codec, table.clone());
            if let Some(scoped) = &scoped {
                update = update.with_telemetry(scoped.clone());
                scoring = scoring.with_telemetry(scoped.clone());
            }
            let mut training = TopicCursor::new(Arc::clone(&topics.training), partitions.iter().copied());
            update.restore(&mut training);
            let mut live = TopicCursor::new(Arc::clone(&topics.live), partitions.iter().copied());
            live.seek_to_end();
            let worker = Worker {
                id,
                partitions,
                scoring,
                update,
                live,
                training,
                models: Arc::clone(&topics.models),
                predictions: Arc::clone(&topics.predictions),
                telemetry: scoped,
            };
            let collected = Arc::clone(&summaries);
            workers.push(spawn_supervised(
                id,
                "worker",
                worker.run(worker_rx.clone()),
                Arc::clone(&faults),
                telemetry.clone(),
                move |summary| collected.lock().push(summary),
            ));
        }
        log(
            telemetry.as_ref(),
            LogLevel::Info,
            "runtime.started",
            json!({
                "application_id": config.application_id,
                "workers": workers.len(),
                "partitions": config.partitions,
                "models": table.len(),
            }),
        );
        Ok(Self {
            config,
            topics,
            table,
            telemetry,
            worker_shutdown,
            aux_shutdown,
            workers,
            auxiliary,
            faults,
            summaries,
        })
    }

    /// Mirrors predictions produced from now on into a JSON-lines file.
    pub fn attach_prediction_sink(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut cursor = TopicCursor::all(Arc::clone(&self.topics.predictions));
        cursor.seek_to_end();
        let sink = PredictionSink::open(path.as_ref(), cursor)
            .context("starting prediction sink")?;
        let telemetry = self.telemetry.clone();
        let path = sink.path().display().to_string();
        self.auxiliary.push(spawn_supervised(
            0,
            "sink",
            sink.run(self.aux_shutdown.subscribe()),
            Arc::clone(&self.faults),
            self.telemetry.clone(),
            move |written| {
                log(
                    telemetry.as_ref(),
                    LogLevel::Info,
                    "runtime.sink.stopped",
                    json!({ "path": path, "written": written }),
                );
            },
        ));
        Ok(())
    }

    /// Topics the runtime reads and writes.
    #[must_use]
    pub const fn topics(&self) -> &RuntimeTopics {
        &self.topics
    }

    /// Read handle onto the local model table replica.
    #[must_use]
    pub fn table(&self) -> ModelTable {
        self.table.clone()
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &StreamsConfig {
        &self.config
    }

    /// Workers that were started.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Faults recorded so far.
    #[must_use]
    pub fn faults(&self) -> Vec<PipelineError> {
        self.faults.lock().clone()
    }

    /// Stops workers, then the replicator and sink, within the grace period.
    ///
    /// Tasks still running at the deadline are aborted and reported as a
    /// [`PipelineError::ShutdownTimeout`].
    pub async fn shutdown(self) -> ShutdownReport {
        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "runtime.shutdown.requested",
            json!({ "grace_ms": self.config.shutdown_grace_ms }),
        );
        let _ = self.worker_shutdown.send(true);
        let mut pending = await_until(self.workers, deadline).await;
        let _ = self.aux_shutdown.send(true);
        pending += await_until(self.auxiliary, deadline).await;
        let mut faults = self.faults.lock().clone();
        if pending > 0 {
            let timeout = PipelineError::ShutdownTimeout { grace, pending };
            log(
                self.telemetry.as_ref(),
                LogLevel::Warn,
                "runtime.shutdown.timeout",
                json!({ "error": timeout.to_string() }),
            );
            faults.push(timeout);
        }
        let mut summaries = self.summaries.lock().clone();
        summaries.sort_by_key(|summary| summary.worker);
        log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "runtime.shutdown.complete",
            json!({ "workers": summaries.len(), "faults": faults.len() }),
        );
        ShutdownReport { summaries, faults }
    }
}

async fn await_until(tasks: Vec<TaskHandle>, deadline: Instant) -> usize {
    let mut pending = 0;
    for mut task in tasks {
        if tokio::time::timeout_at(deadline, &mut task.supervisor)
            .await
            .is_err()
        {
            task.abort.abort();
            task.supervisor.abort();
            pending += 1;
        }
    }
    pending
}

fn spawn_supervised<R, F, S>(
    worker: usize,
    role: &'static str,
    future: F,
    faults: Arc<Mutex<Vec<PipelineError>>>,
    telemetry: Option<Telemetry>,
    on_success: S,
) -> TaskHandle
where
    R: Send + 'static,
    F: Future<Output = Result<R>> + Send + 'static,
    S: FnOnce(R) + Send + 'static,
{
    let task = tokio::spawn(future);
    let abort = task.abort_handle();
    let supervisor = tokio::spawn(async move {
        let cause = match task.await {
            Ok(Ok(result)) => {
                on_success(result);
                return;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(join) if join.is_cancelled() => return,
            Err(join) => panic_message(join.into_panic()),
        };
        let fault = PipelineError::WorkerFault { worker, role, cause };
        log(
            telemetry.as_ref(),
            LogLevel::Error,
            "runtime.worker.fault",
            json!({ "worker": worker, "role": role, "error": fault.to_string() }),
        );
        if let Some(telemetry) = &telemetry {
            let _ = telemetry.event(
                "runtime.worker.fault",
                json!({ "worker": worker, "role": role }),
            );
        }
        faults.lock().push(fault);
    });
    TaskHandle { abort, supervisor }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".into())
}

fn log(telemetry: Option<&Telemetry>, level: LogLevel, message: &str, metadata: serde_json::Value) {
    if let Some(telemetry) = telemetry {
        let _ = telemetry.log(level, message, metadata);
    }
}
