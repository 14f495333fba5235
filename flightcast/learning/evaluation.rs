use serde::{Deserialize, Serialize};

/// Accumulates `(label, score)` pairs and reports ranking and threshold metrics.
#[derive(Debug, Clone, Default)]
pub struct AucEvaluator {
    threshold: f64,
    scored: Vec<(u8, f64)>,
}

/// Metrics for one evaluated key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Area under the ROC curve; `None` when the test set lacks a class.
    pub auc: Option<f64>,
    /// Share of examples classified correctly at the threshold.
    pub accuracy: Option<f64>,
    /// Examples evaluated.
    pub samples: usize,
}

impl AucEvaluator {
    /// Evaluator classifying scores `>= threshold` as positive.
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self {
            threshold,
            scored: Vec::new(),
        }
    }

    /// Records one example.
    pub fn add(&mut self, label: u8, score: f64) {
        self.scored.push((label, score));
    }

    /// Examples recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scored.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scored.is_empty()
    }

    /// Mann-Whitney estimate of the AUC; ties count half.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn auc(&self) -> Option<f64> {
        let mut ranked = self.scored.clone();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        let positives = ranked.iter().filter(|(label, _)| *label == 1).count();
        let negatives = ranked.len() - positives;
        if positives == 0 || negatives == 0 {
            return None;
        }
        let mut positive_rank_sum = 0.0;
        let mut idx = 0;
        while idx < ranked.len() {
            let mut end = idx;
            while end + 1 < ranked.len() && ranked[end + 1].1.total_cmp(&ranked[idx].1).is_eq() {
                end += 1;
            }
            // ranks are 1-based; tied runs share their mean rank
            let mean_rank = (idx + end) as f64 / 2.0 + 1.0;
            let tied_positives = ranked[idx..=end].iter().filter(|(label, _)| *label == 1).count();
            positive_rank_sum += mean_rank * tied_positives as f64;
            idx = end + 1;
        }
        let positives = positives as f64;
        let negatives = negatives as f64;
        Some((positive_rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives))
    }

    /// Fraction of examples on the right side of the threshold.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accuracy(&self) -> Option<f64> {
        if self.scored.is_empty() {
            return None;
        }
        let correct = self
            .scored
            .iter()
            .filter(|(label, score)| (*score >= self.threshold) == (*label == 1))
            .count();
        Some(correct as f64 / self.scored.len() as f64)
    }

    /// Snapshot of every metric.
    #[must_use]
    pub fn report(&self) -> EvaluationReport {
        EvaluationReport {
            auc: self.auc(),
            accuracy: self.accuracy(),
            samples: self.scored.len(),
        }
    }
}
