use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use thiserror::Error;

use crate::codec::FeatureCodec;

/// Raw rows of a flight file grouped by partition key, in file order.
#[derive(Debug, Clone, Default)]
pub struct KeyedRows {
    /// Rows per key; keys appear in first-seen order.
    pub rows: IndexMap<String, Vec<String>>,
    /// Lines without a usable key (blank, headerless garbage).
    pub skipped: usize,
}

impl KeyedRows {
    /// Total rows kept.
    #[must_use]
    pub fn total(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

/// Reads `path` and groups its rows by origin airport.
///
/// Only the key column is inspected here; full decoding happens at training
/// time so a malformed row costs nothing until it is sampled.
pub fn load_rows_by_key(
    path: impl AsRef<Path>,
    codec: &FeatureCodec,
) -> Result<KeyedRows, DataLoaderError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| DataLoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut keyed = KeyedRows::default();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| DataLoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match codec.key_of(&line) {
            Ok(key) => {
                let key = key.to_string();
                keyed.rows.entry(key).or_default().push(line);
            }
            Err(_) => keyed.skipped += 1,
        }
    }
    if keyed.rows.is_empty() {
        return Err(DataLoaderError::NoRows(path.to_path_buf()));
    }
    Ok(keyed)
}

/// Errors raised while loading an offline training file.
#[derive(Debug, Error)]
pub enum DataLoaderError {
    /// File contained no keyed rows.
    #[error("{0} contains no usable rows")]
    NoRows(PathBuf),
    /// Filesystem failure.
    #[error("reading {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn groups_rows_by_origin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flights.csv");
        fs::write(
            &path,
            "JFK,1,2,3,900,1100,500,0,0\nLAX,1,2,3,900,1100,500,0,1\n\n,bad\nJFK,1,3,4,900,1100,500,20,1\n",
        )
        .unwrap();
        let keyed = load_rows_by_key(&path, &FeatureCodec::default()).unwrap();
        assert_eq!(keyed.rows.keys().collect::<Vec<_>>(), vec!["JFK", "LAX"]);
        assert_eq!(keyed.rows["JFK"].len(), 2);
        assert_eq!(keyed.skipped, 1);
        assert_eq!(keyed.total(), 3);
    }

    #[test]
    fn missing_or_empty_files_fail() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_rows_by_key(dir.path().join("absent.csv"), &FeatureCodec::default()),
            Err(DataLoaderError::Io { .. })
        ));
        let empty = dir.path().join("empty.csv");
        fs::write(&empty, "\n\n").unwrap();
        assert!(matches!(
            load_rows_by_key(&empty, &FeatureCodec::default()),
            Err(DataLoaderError::NoRows(_))
        ));
    }
}
