use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use flightcast_learning::{FeatureCodec, KeyModel, ModelBuilder, OnlineTrainer, Telemetry};
use flightcast_streams::{ingest_file, ModelTableReplicator, StreamsConfig, StreamsRuntime};
use serde::Serialize;
use serde_json::json;
use shared_feeds::{Broker, Cleanup};
use shared_logging::LogLevel;

const TELEMETRY_TOPIC: &str = "flightcast-telemetry";

#[derive(Parser, Debug)]
#[command(name = "flightcast", version, about = "Online flight delay scoring with continuous retraining")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trains one model per origin airport from a flight file.
    BuildModels {
        /// Delimited flight rows.
        #[arg(long)]
        input: PathBuf,
        /// Streams configuration; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Writes `{key, model}` JSON lines here.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Publishes the models into the change-log under `data_dir`.
        #[arg(long)]
        publish: bool,
        /// Overrides the sampling seed.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Runs the scoring and update pipelines until Ctrl-C.
    Run(RunArgs),
    /// Prints the replicated model table.
    Models {
        /// Streams configuration with a `data_dir`.
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Streams configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Labelled rows to publish to the training topic after startup.
    #[arg(long)]
    training: Option<PathBuf>,
    /// Live rows to publish to the live topic after the training file.
    #[arg(long)]
    live: Option<PathBuf>,
    /// Mirrors predictions into this JSON-lines file.
    #[arg(long)]
    predictions: Option<PathBuf>,
    /// Overrides the worker count.
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ExportedModel<'a> {
    key: &'a str,
    model: String,
    train_rows: usize,
    test_rows: usize,
    auc: Option<f64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::BuildModels {
            input,
            config,
            output,
            publish,
            seed,
        } => {
            let mut config = load_config(config.as_deref())?;
            if seed.is_some() {
                config.training.seed = seed;
            }
            handle_build(&config, &input, output.as_deref(), publish)
        }
        Commands::Run(args) => {
            let mut config = load_config(args.config.as_deref())?;
            if let Some(workers) = args.workers {
                config.workers = workers;
            }
            config.validate()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.workers)
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            runtime.block_on(handle_run(config, args))
        }
        Commands::Models { config } => handle_models(&load_config(Some(&config))?),
    }
}

fn load_config(path: Option<&Path>) -> Result<StreamsConfig> {
    path.map_or_else(|| Ok(StreamsConfig::default()), StreamsConfig::load)
}

fn open_broker(config: &StreamsConfig) -> Result<Broker> {
    let broker = Broker::new(config.partitions);
    match &config.data_dir {
        Some(dir) => broker
            .with_data_dir(dir)
            .with_context(|| format!("opening data directory {}", dir.display())),
        None => Ok(broker),
    }
}

fn build_telemetry(config: &StreamsConfig, broker: &Broker, module: &str) -> Result<Telemetry> {
    let mut builder = Telemetry::builder(module).min_level(config.log_level()?);
    builder = match &config.log_path {
        Some(path) => builder.log_path(path),
        None => builder.stderr(),
    };
    let events = broker.topic(TELEMETRY_TOPIC, Cleanup::Delete { max_records: 10_000 })?;
    builder.event_publisher(events).build()
}

fn handle_build(
    config: &StreamsConfig,
    input: &Path,
    output: Option<&Path>,
    publish: bool,
) -> Result<()> {
    if publish && config.data_dir.is_none() {
        bail!("--publish needs a data_dir in the configuration");
    }
    let broker = open_broker(config)?;
    let telemetry = build_telemetry(config, &broker, "offline")?;
    let models = ModelBuilder::new(config.training)
        .with_params(config.trainer)
        .with_telemetry(telemetry.clone())
        .train_file(input)?;
    for (key, model) in &models {
        println!(
            "{key} | train {} | test {} | skipped {} | auc {} | accuracy {}",
            model.train_rows,
            model.test_rows,
            model.parse_failures,
            format_metric(model.report.auc),
            format_metric(model.report.accuracy),
        );
    }
    if let Some(path) = output {
        export_models(path, &models)?;
        println!("wrote {} model(s) to {}", models.len(), path.display());
    }
    if publish {
        let changelog = broker.topic(
            &config.topics.models,
            Cleanup::Compact {
                every: config.topics.compact_every,
            },
        )?;
        for (key, model) in &models {
            let stored = changelog.append(key, model.trainer.serialize())?;
            let _ = telemetry.log(
                LogLevel::Info,
                "offline.model.published",
                json!({ "key": key, "version": stored.offset }),
            );
        }
        println!("published {} model(s) to '{}'", models.len(), config.topics.models);
    }
    Ok(())
}

fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".into(), |value| format!("{value:.3}"))
}

fn export_models<'a>(
    path: &Path,
    models: impl IntoIterator<Item = (&'a String, &'a KeyModel)>,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for (key, model) in models {
        let line = ExportedModel {
            key,
            model: STANDARD.encode(model.trainer.serialize()),
            train_rows: model.train_rows,
            test_rows: model.test_rows,
            auc: model.report.auc,
        };
        serde_json::to_writer(&mut writer, &line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn check_inputs(args: &RunArgs) -> Result<()> {
    for path in [&args.training, &args.live].into_iter().flatten() {
        File::open(path).with_context(|| format!("opening input {}", path.display()))?;
    }
    Ok(())
}

async fn handle_run(config: StreamsConfig, args: RunArgs) -> Result<()> {
    check_inputs(&args)?;
    let broker = open_broker(&config)?;
    let telemetry = build_telemetry(&config, &broker, "runtime")?;
    let mut runtime = StreamsRuntime::start(config, &broker, Some(telemetry.clone())).await?;
    if let Some(path) = &args.predictions {
        runtime.attach_prediction_sink(path)?;
    }
    let topics = runtime.topics().clone();
    let ingest_telemetry = telemetry.scoped("ingest");
    let mut ingestion = tokio::spawn(async move {
        let codec = FeatureCodec::default();
        let inputs = [(args.training, topics.training), (args.live, topics.live)];
        for (path, topic) in inputs {
            let Some(path) = path else { continue };
            let stats = ingest_file(&path, &*topic, &codec).await?;
            let _ = ingest_telemetry.log(
                LogLevel::Info,
                "ingest.file.complete",
                json!({ "path": path.display().to_string(), "published": stats.published, "skipped": stats.skipped }),
            );
        }
        anyhow::Ok(())
    });
    println!(
        "flightcast running with {} worker(s); press Ctrl-C to stop",
        runtime.worker_count()
    );
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            ingestion.abort();
            signal.context("waiting for Ctrl-C")
        }
        ingested = &mut ingestion => match ingested {
            Ok(Ok(())) => tokio::signal::ctrl_c().await.context("waiting for Ctrl-C"),
            Ok(Err(err)) => Err(err.context("ingesting input files")),
            Err(err) => Err(anyhow!("ingestion task failed: {err}")),
        },
    };
    let report = runtime.shutdown().await;
    for fault in &report.faults {
        eprintln!("{fault}");
    }
    println!("{}", serde_json::to_string_pretty(&report.summaries)?);
    outcome
}

fn handle_models(config: &StreamsConfig) -> Result<()> {
    if config.data_dir.is_none() {
        bail!("models needs a data_dir in the configuration");
    }
    let broker = open_broker(config)?;
    let changelog = broker.topic(
        &config.topics.models,
        Cleanup::Compact {
            every: config.topics.compact_every,
        },
    )?;
    let mut replicator = ModelTableReplicator::new(changelog);
    replicator.bootstrap();
    let table = replicator.table();
    if table.is_empty() {
        println!("no models in '{}'", config.topics.models);
    }
    for snapshot in table.snapshots() {
        println!(
            "{} | version {} | {} bytes",
            snapshot.key,
            snapshot.version,
            snapshot.weights.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flightcast_learning::{LogisticRegression, TrainingConfig, FEATURE_DIM};
    use tempfile::tempdir;

    #[test]
    fn exported_models_decode() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flights.csv");
        let mut rows = String::new();
        for day in 1..=20 {
            rows.push_str(&format!("JFK,7,{day},5,1800,2100,900,{},1\n", 40 + day));
            rows.push_str(&format!("JFK,7,{day},5,0600,0800,900,-{day},0\n"));
        }
        fs::write(&input, rows).unwrap();
        let models = ModelBuilder::new(TrainingConfig {
            seed: Some(1),
            ..TrainingConfig::default()
        })
        .train_file(&input)
        .unwrap();
        let output = dir.path().join("out/models.jsonl");
        export_models(&output, &models).unwrap();
        let line = fs::read_to_string(&output).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["key"], "JFK");
        let bytes = STANDARD.decode(value["model"].as_str().unwrap()).unwrap();
        assert!(LogisticRegression::deserialize(&bytes, FEATURE_DIM).is_ok());
    }

    #[test]
    fn publish_then_list_models() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flights.csv");
        fs::write(
            &input,
            "BOS,1,1,1,900,1100,300,0,0\nBOS,1,2,2,1900,2100,300,45,1\nBOS,1,3,3,1000,1200,300,2,0\n",
        )
        .unwrap();
        let config = StreamsConfig {
            data_dir: Some(dir.path().join("state")),
            log_path: Some(dir.path().join("flightcast.log")),
            ..StreamsConfig::default()
        };
        handle_build(&config, &input, None, true).unwrap();
        handle_models(&config).unwrap();
        let broker = open_broker(&config).unwrap();
        let mut replicator = ModelTableReplicator::new(
            broker
                .topic(&config.topics.models, Cleanup::Compact { every: 1024 })
                .unwrap(),
        );
        replicator.bootstrap();
        assert!(replicator.table().get("BOS").is_some());
    }

    #[tokio::test]
    async fn run_fails_fast_on_missing_inputs() {
        let dir = tempdir().unwrap();
        let config = StreamsConfig {
            log_path: Some(dir.path().join("flightcast.log")),
            ..StreamsConfig::default()
        };
        let args = RunArgs {
            config: None,
            training: Some(dir.path().join("missing.csv")),
            live: None,
            predictions: None,
            workers: None,
        };
        let err = handle_run(config, args).await.unwrap_err();
        assert!(format!("{err:#}").contains("missing.csv"));
    }

    #[test]
    fn publishing_requires_a_data_dir() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flights.csv");
        fs::write(&input, "BOS,1,1,1,900,1100,300,0,0\n").unwrap();
        let config = StreamsConfig {
            log_path: Some(dir.path().join("flightcast.log")),
            ..StreamsConfig::default()
        };
        assert!(handle_build(&config, &input, None, true).is_err());
        assert!(handle_models(&config).is_err());
    }
}
