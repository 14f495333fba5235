use std::fmt;

use thiserror::Error;

/// Columns of a raw flight row, in order.
pub const COLUMNS: [&str; COLUMN_COUNT] = [
    "origin",
    "month",
    "day_of_month",
    "day_of_week",
    "scheduled_departure",
    "scheduled_arrival",
    "distance",
    "departure_delay",
    "delayed",
];

/// Number of delimited columns in a raw row.
pub const COLUMN_COUNT: usize = 9;

/// Length of every feature vector: a bias term plus one value per numeric column.
pub const FEATURE_DIM: usize = 8;

const KEY_COLUMN: usize = 0;
const LABEL_COLUMN: usize = COLUMN_COUNT - 1;

/// Divisors mapping each numeric column onto roughly unit scale.
const SCALES: [f64; FEATURE_DIM - 1] = [12.0, 31.0, 7.0, 2400.0, 2400.0, 5000.0, 60.0];

/// Why a raw row could not become a [`FeatureRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Row split into the wrong number of columns.
    #[error("expected {expected} columns, found {found}")]
    ColumnCount {
        /// Columns required by the layout.
        expected: usize,
        /// Columns present in the row.
        found: usize,
    },
    /// Partition key column is blank.
    #[error("partition key column is empty")]
    EmptyKey,
    /// A numeric column did not parse as a finite float.
    #[error("column '{column}' is not a finite number: '{value}'")]
    InvalidNumber {
        /// Column name.
        column: &'static str,
        /// Raw text found.
        value: String,
    },
    /// Label column is neither `0` nor `1`.
    #[error("label must be 0 or 1, found '{0}'")]
    InvalidLabel(String),
}

/// Immutable, fully validated training or scoring input.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    key: String,
    features: [f64; FEATURE_DIM],
    label: u8,
}

impl FeatureRecord {
    /// Builds a record from already-scaled features.
    pub fn new(
        key: impl Into<String>,
        features: [f64; FEATURE_DIM],
        label: u8,
    ) -> Result<Self, ParseError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ParseError::EmptyKey);
        }
        if label > 1 {
            return Err(ParseError::InvalidLabel(label.to_string()));
        }
        if let Some(idx) = features.iter().position(|value| !value.is_finite()) {
            return Err(ParseError::InvalidNumber {
                column: feature_name(idx),
                value: features[idx].to_string(),
            });
        }
        Ok(Self {
            key,
            features,
            label,
        })
    }

    /// Partition key (origin airport).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Feature vector, bias first.
    #[must_use]
    pub const fn features(&self) -> &[f64; FEATURE_DIM] {
        &self.features
    }

    /// Observed label: 1 when the flight was delayed.
    #[must_use]
    pub const fn label(&self) -> u8 {
        self.label
    }
}

impl fmt::Display for FeatureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[label={}]", self.key, self.label)
    }
}

fn feature_name(idx: usize) -> &'static str {
    if idx == 0 {
        "bias"
    } else {
        COLUMNS[idx]
    }
}

/// Decoder for delimited flight rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureCodec {
    delimiter: char,
}

impl Default for FeatureCodec {
    fn default() -> Self {
        Self { delimiter: ',' }
    }
}

impl FeatureCodec {
    /// Codec splitting on `delimiter`.
    #[must_use]
    pub const fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    /// Column delimiter.
    #[must_use]
    pub const fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Parses a raw row; never yields a partial record.
    pub fn decode(&self, raw: &str) -> Result<FeatureRecord, ParseError> {
        let columns: Vec<&str> = raw.trim().split(self.delimiter).map(str::trim).collect();
        if columns.len() != COLUMN_COUNT {
            return Err(ParseError::ColumnCount {
                expected: COLUMN_COUNT,
                found: columns.len(),
            });
        }
        let key = columns[KEY_COLUMN];
        if key.is_empty() {
            return Err(ParseError::EmptyKey);
        }
        let mut features = [0.0; FEATURE_DIM];
        features[0] = 1.0;
        for (column, scale) in (1..LABEL_COLUMN).zip(SCALES) {
            features[column] = parse_number(COLUMNS[column], columns[column])? / scale;
        }
        let label = match columns[LABEL_COLUMN] {
            "0" => 0,
            "1" => 1,
            other => return Err(ParseError::InvalidLabel(other.to_string())),
        };
        Ok(FeatureRecord {
            key: key.to_string(),
            features,
            label,
        })
    }

    /// Partition key of a raw row, without decoding the rest.
    pub fn key_of<'a>(&self, raw: &'a str) -> Result<&'a str, ParseError> {
        let key = raw
            .trim()
            .split(self.delimiter)
            .nth(KEY_COLUMN)
            .map(str::trim)
            .unwrap_or_default();
        if key.is_empty() {
            Err(ParseError::EmptyKey)
        } else {
            Ok(key)
        }
    }
}

fn parse_number(column: &'static str, raw: &str) -> Result<f64, ParseError> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber {
            column,
            value: raw.to_string(),
        })
}
