use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use shared_feeds::TopicCursor;
use tokio::sync::watch;

/// Mirrors the predictions topic into a JSON-lines file.
#[derive(Debug)]
pub struct PredictionSink {
    path: PathBuf,
    writer: BufWriter<File>,
    cursor: TopicCursor,
    written: u64,
}

impl PredictionSink {
    /// Appends to `path` (parents created) everything `cursor` reads from now on.
    pub fn open(path: impl AsRef<Path>, cursor: TopicCursor) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening prediction file {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            cursor,
            written: 0,
        })
    }

    /// Output file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Writes everything currently readable; returns the lines written.
    pub fn drain(&mut self) -> Result<usize> {
        let mut lines = 0;
        loop {
            let batch = self.cursor.poll(256);
            if batch.is_empty() {
                break;
            }
            for record in &batch {
                self.writer.write_all(&record.value)?;
                self.writer.write_all(b"\n")?;
            }
            lines += batch.len();
        }
        self.writer.flush()?;
        self.written += lines as u64;
        Ok(lines)
    }

    /// Tails the topic until `shutdown` flips to `true`, then drains once more.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64> {
        let mut changes = self.cursor.topic().subscribe();
        loop {
            changes.borrow_and_update();
            self.drain()?;
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                stopped = shutdown.changed() => {
                    if stopped.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
        self.drain()?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shared_feeds::{Cleanup, Topic};
    use tempfile::tempdir;

    #[test]
    fn drain_writes_one_line_per_record() {
        let dir = tempdir().unwrap();
        let topic = Arc::new(Topic::new("predictions", 2, Cleanup::Retain));
        topic.append("JFK", br#"{"key":"JFK"}"#.to_vec()).unwrap();
        topic.append("LAX", br#"{"key":"LAX"}"#.to_vec()).unwrap();
        let path = dir.path().join("out/predictions.jsonl");
        let mut sink = PredictionSink::open(&path, TopicCursor::all(Arc::clone(&topic))).unwrap();
        assert_eq!(sink.drain().unwrap(), 2);
        assert_eq!(sink.drain().unwrap(), 0);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains(r#"{"key":"LAX"}"#));
        assert_eq!(sink.written(), 2);
    }

    #[tokio::test]
    async fn run_flushes_on_shutdown() {
        let dir = tempdir().unwrap();
        let topic = Arc::new(Topic::new("predictions", 1, Cleanup::Retain));
        let path = dir.path().join("predictions.jsonl");
        let sink = PredictionSink::open(&path, TopicCursor::all(Arc::clone(&topic))).unwrap();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(sink.run(shutdown));
        topic.append("JFK", b"{}".to_vec()).unwrap();
        stop.send(true).unwrap();
        let written = task.await.unwrap().unwrap();
        assert_eq!(written, 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}\n");
    }
}
