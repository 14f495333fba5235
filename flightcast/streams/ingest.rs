use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use flightcast_learning::FeatureCodec;
use serde::Serialize;
use shared_feeds::FeedPublisher;

/// Counters from loading a file into a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Rows published.
    pub published: usize,
    /// Blank lines or rows without a key.
    pub skipped: usize,
}

/// Publishes every keyed line of `path` to `topic`, keyed by origin airport.
///
/// Rows are routed on their key alone; full validation is left to the
/// consuming pipeline so a malformed row is dropped where it is read.
pub async fn ingest_file(
    path: impl AsRef<Path>,
    topic: &dyn FeedPublisher,
    codec: &FeatureCodec,
) -> Result<IngestStats> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut stats = IngestStats::default();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        let Ok(key) = codec.key_of(&line) else {
            stats.skipped += 1;
            continue;
        };
        let key = key.to_string();
        topic.publish(&key, line.into_bytes()).await?;
        stats.published += 1;
    }
    Ok(stats)
}
