use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::FeedRecord;

#[derive(Debug, Serialize, Deserialize)]
struct JournalMeta {
    partitions: u32,
}

/// JSON-lines file backing a topic.
#[derive(Debug)]
pub(crate) struct Journal {
    path: PathBuf,
    writer: Mutex<File>,
}

impl Journal {
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating journal dir {}", parent.display()))?;
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Records the partition count on first open and rejects any other count afterwards.
    ///
    /// Offsets are only ordered within a partition, so a key must never move
    /// to another partition of an existing journal.
    pub(crate) fn pin_partitions(&self, partitions: u32) -> Result<()> {
        let meta_path = self.path.with_extension("meta.json");
        if meta_path.exists() {
            let raw = fs::read_to_string(&meta_path)
                .with_context(|| format!("reading {}", meta_path.display()))?;
            let meta: JournalMeta = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", meta_path.display()))?;
            if meta.partitions != partitions {
                bail!(
                    "journal {} was written with {} partitions, not {partitions}",
                    self.path.display(),
                    meta.partitions
                );
            }
            return Ok(());
        }
        fs::write(&meta_path, serde_json::to_vec(&JournalMeta { partitions })?)
            .with_context(|| format!("writing {}", meta_path.display()))
    }

    /// Reads every record. A torn final line (crash mid-write) is ignored.
    pub(crate) fn replay(&self) -> Result<Vec<FeedRecord>> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening journal {}", self.path.display()))?;
        let lines = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("reading journal {}", self.path.display()))?;
        let last = lines.len().saturating_sub(1);
        let mut records = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedRecord>(line) {
                Ok(record) => records.push(record),
                Err(_) if idx == last => break,
                Err(err) => bail!(
                    "corrupt journal {} at line {}: {err}",
                    self.path.display(),
                    idx + 1
                ),
            }
        }
        Ok(records)
    }

    pub(crate) fn append(&self, record: &FeedRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock();
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .with_context(|| format!("appending to journal {}", self.path.display()))
    }

    /// Atomically replaces the journal contents with `records`.
    pub(crate) fn rewrite<'a>(&self, records: impl Iterator<Item = &'a FeedRecord>) -> Result<()> {
        let mut writer = self.writer.lock();
        let staging = self.path.with_extension("jsonl.compacting");
        {
            let file = File::create(&staging)
                .with_context(|| format!("creating {}", staging.display()))?;
            let mut out = BufWriter::new(file);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replacing journal {}", self.path.display()))?;
        *writer = open_append(&self.path)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening journal {}", path.display()))
}
