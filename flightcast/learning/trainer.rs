//! Incremental binary classifier behind a four-operation trait.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::FeatureRecord;

/// Capability the pipelines need from a per-key model.
///
/// Implementations own their numeric state; the pipelines only ever call
/// these four operations.
pub trait OnlineTrainer: Sized {
    /// Applies one incremental update for a labelled example.
    fn train(&mut self, label: u8, features: &[f64]);

    /// Probability in `[0, 1]` that `features` belong to class 1.
    fn score_probability(&self, features: &[f64]) -> f64;

    /// Encodes the full model state.
    fn serialize(&self) -> Vec<u8>;

    /// Restores a model scoring `dimension` features; scoring after a round
    /// trip is bit-identical. A snapshot of any other width is rejected.
    fn deserialize(bytes: &[u8], dimension: usize) -> Result<Self, SerializationError>;
}

/// Runs `epochs` passes of single-record updates over `records`, in order.
pub fn train_epochs<T: OnlineTrainer>(trainer: &mut T, records: &[FeatureRecord], epochs: usize) {
    for _ in 0..epochs {
        for record in records {
            trainer.train(record.label(), record.features());
        }
    }
}

/// Corrupt or foreign snapshot bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    /// Fewer bytes than the header or weight block requires.
    #[error("snapshot truncated: needed {needed} bytes, found {found}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        found: usize,
    },
    /// Leading magic does not identify a logistic-regression snapshot.
    #[error("snapshot magic mismatch")]
    BadMagic,
    /// Written by an unknown format version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),
    /// Dimension outside `1..=MAX_DIMENSION`.
    #[error("snapshot dimension {0} out of range")]
    Dimension(u32),
    /// Well-formed snapshot for a different feature width.
    #[error("snapshot scores {found} features, expected {expected}")]
    DimensionMismatch {
        /// Width the caller scores.
        expected: usize,
        /// Width stored in the snapshot.
        found: u32,
    },
    /// Extra bytes after the weight block.
    #[error("{0} trailing bytes after snapshot")]
    TrailingBytes(usize),
    /// A stored weight or hyper-parameter is NaN or infinite.
    #[error("snapshot field '{0}' is not finite")]
    NonFinite(&'static str),
}

/// SGD hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerParams {
    /// Initial step size.
    pub learning_rate: f64,
    /// Multiplicative step-size decay applied after every update.
    pub decay: f64,
    /// Floor for the decayed step size.
    pub min_learning_rate: f64,
    /// L1 shrinkage strength.
    pub l1: f64,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            decay: 0.999,
            min_learning_rate: 0.01,
            l1: 1e-5,
        }
    }
}

impl TrainerParams {
    /// Rejects parameters that would make every snapshot unreadable or training diverge.
    pub fn validate(&self) -> Result<()> {
        let Self {
            learning_rate,
            decay,
            min_learning_rate,
            l1,
        } = *self;
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            bail!("trainer.learning_rate must be finite and positive, got {learning_rate}");
        }
        if !(decay > 0.0 && decay <= 1.0) {
            bail!("trainer.decay must lie in (0, 1], got {decay}");
        }
        if !(min_learning_rate.is_finite() && min_learning_rate >= 0.0) {
            bail!("trainer.min_learning_rate must be finite and non-negative, got {min_learning_rate}");
        }
        if !(l1.is_finite() && l1 >= 0.0) {
            bail!("trainer.l1 must be finite and non-negative, got {l1}");
        }
        Ok(())
    }
}

const MAGIC: &[u8; 4] = b"FCLR";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 8 + 5 * 8;
/// Largest weight vector accepted from snapshot bytes.
pub const MAX_DIMENSION: u32 = 4096;

/// Logistic regression trained by annealed SGD with L1 shrinkage.
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    params: TrainerParams,
    weights: Vec<f64>,
    steps: u64,
    rate: f64,
}

impl LogisticRegression {
    /// Zero-initialised model over `dimension` features.
    #[must_use]
    pub fn new(dimension: usize, params: TrainerParams) -> Self {
        Self {
            params,
            weights: vec![0.0; dimension],
            steps: 0,
            rate: params.learning_rate,
        }
    }

    /// Number of weights.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.weights.len()
    }

    /// Current weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Updates applied so far.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Hyper-parameters.
    #[must_use]
    pub const fn params(&self) -> TrainerParams {
        self.params
    }

    fn margin(&self, features: &[f64]) -> f64 {
        debug_assert_eq!(features.len(), self.weights.len());
        self.weights
            .iter()
            .zip(features)
            .map(|(weight, value)| weight * value)
            .sum()
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

impl OnlineTrainer for LogisticRegression {
    fn train(&mut self, label: u8, features: &[f64]) {
        let target = if label == 0 { 0.0 } else { 1.0 };
        let gradient = target - sigmoid(self.margin(features));
        let rate = self.rate;
        let shrink = rate * self.params.l1;
        for (weight, value) in self.weights.iter_mut().zip(features) {
            let updated = *weight + rate * gradient * value;
            *weight = updated.signum() * (updated.abs() - shrink).max(0.0);
        }
        self.steps += 1;
        self.rate = (self.rate * self.params.decay).max(self.params.min_learning_rate);
    }

    fn score_probability(&self, features: &[f64]) -> f64 {
        sigmoid(self.margin(features))
    }

    fn serialize(&self) -> Vec<u8> {
        let dimension = u32::try_from(self.weights.len()).unwrap_or(u32::MAX);
        let mut out = Vec::with_capacity(HEADER_LEN + self.weights.len() * 8);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&dimension.to_le_bytes());
        out.extend_from_slice(&self.steps.to_le_bytes());
        for value in [
            self.rate,
            self.params.learning_rate,
            self.params.decay,
            self.params.min_learning_rate,
            self.params.l1,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for weight in &self.weights {
            out.extend_from_slice(&weight.to_le_bytes());
        }
        out
    }

    fn deserialize(bytes: &[u8], expected: usize) -> Result<Self, SerializationError> {
        let mut reader = Reader::new(bytes);
        if reader.take::<4>()? != *MAGIC {
            return Err(SerializationError::BadMagic);
        }
        let version = u16::from_le_bytes(reader.take()?);
        if version != FORMAT_VERSION {
            return Err(SerializationError::UnsupportedVersion(version));
        }
        let dimension = u32::from_le_bytes(reader.take()?);
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(SerializationError::Dimension(dimension));
        }
        if usize::try_from(dimension).ok() != Some(expected) {
            return Err(SerializationError::DimensionMismatch {
                expected,
                found: dimension,
            });
        }
        let steps = u64::from_le_bytes(reader.take()?);
        let rate = reader.finite("rate")?;
        let params = TrainerParams {
            learning_rate: reader.finite("learning_rate")?,
            decay: reader.finite("decay")?,
            min_learning_rate: reader.finite("min_learning_rate")?,
            l1: reader.finite("l1")?,
        };
        let weights = (0..dimension)
            .map(|_| reader.finite("weight"))
            .collect::<Result<Vec<_>, _>>()?;
        reader.finish()?;
        Ok(Self {
            params,
            weights,
            steps,
            rate,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], SerializationError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(SerializationError::Truncated {
                needed: end,
                found: self.bytes.len(),
            })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn finite(&mut self, field: &'static str) -> Result<f64, SerializationError> {
        let value = f64::from_le_bytes(self.take()?);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(SerializationError::NonFinite(field))
        }
    }

    fn finish(&self) -> Result<(), SerializationError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            extra => Err(SerializationError::TrailingBytes(extra)),
        }
    }
}
