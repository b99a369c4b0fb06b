//! ROC curve, AUC and thresholded confusion matrix for binary scores.

use std::cmp::Ordering;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    #[error("labels ({labels}) and scores ({scores}) differ in length")]
    LengthMismatch { labels: usize, scores: usize },
    #[error("no samples to score")]
    Empty,
    #[error("ROC is undefined with a single class present (positives={positives}, negatives={negatives})")]
    SingleClass { positives: u64, negatives: u64 },
    #[error("score at index {index} is not finite")]
    NonFiniteScore { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Descending; the first entry is `+inf` for the `(0, 0)` point. JSON has
    /// no infinity, so it is written as `null` and read back as `+inf`.
    #[serde(with = "infinite_as_null")]
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    pub fn auc(&self) -> f64 {
        auc(&self.fpr, &self.tpr)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tn: u64,
    pub fp: u64,
    pub fn_: u64,
    pub tp: u64,
}

impl ConfusionMatrix {
    /// `[[tn, fp], [fn, tp]]`, rows = true class, columns = predicted class.
    pub fn as_matrix(&self) -> [[u64; 2]; 2] {
        [[self.tn, self.fp], [self.fn_, self.tp]]
    }

    pub fn total(&self) -> u64 {
        self.tn + self.fp + self.fn_ + self.tp
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

pub fn roc_curve(
    labels: ArrayView1<'_, u8>,
    scores: ArrayView1<'_, f64>,
) -> Result<RocCurve, MetricsError> {
    if labels.len() != scores.len() {
        return Err(MetricsError::LengthMismatch {
            labels: labels.len(),
            scores: scores.len(),
        });
    }
    if labels.is_empty() {
        return Err(MetricsError::Empty);
    }
    if let Some(index) = scores.iter().position(|score| !score.is_finite()) {
        return Err(MetricsError::NonFiniteScore { index });
    }

    let positives = labels.iter().filter(|label| **label == 1).count() as u64;
    let negatives = labels.len() as u64 - positives;
    if positives == 0 || negatives == 0 {
        return Err(MetricsError::SingleClass {
            positives,
            negatives,
        });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*b].partial_cmp(&scores[*a]).unwrap_or(Ordering::Equal));

    let mut curve = RocCurve {
        fpr: vec![0.0],
        tpr: vec![0.0],
        thresholds: vec![f64::INFINITY],
    };
    let (mut tps, mut fps) = (0u64, 0u64);
    for (rank, idx) in order.iter().enumerate() {
        if labels[*idx] == 1 {
            tps += 1;
        } else {
            fps += 1;
        }
        let last_of_tie = order
            .get(rank + 1)
            .map_or(true, |next| scores[*next] != scores[*idx]);
        if last_of_tie {
            curve.fpr.push(fps as f64 / negatives as f64);
            curve.tpr.push(tps as f64 / positives as f64);
            curve.thresholds.push(scores[*idx]);
        }
    }

    Ok(curve)
}

/// Trapezoidal area under a curve with non-decreasing `x`.
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[1] + ys[0]) / 2.0)
        .sum()
}

/// Predicts the positive class when `score > threshold`.
pub fn confusion_matrix(
    labels: ArrayView1<'_, u8>,
    scores: ArrayView1<'_, f64>,
    threshold: f64,
) -> Result<ConfusionMatrix, MetricsError> {
    if labels.len() != scores.len() {
        return Err(MetricsError::LengthMismatch {
            labels: labels.len(),
            scores: scores.len(),
        });
    }

    let mut matrix = ConfusionMatrix::default();
    for (label, score) in labels.iter().zip(scores.iter()) {
        match (*label == 1, *score > threshold) {
            (false, false) => matrix.tn += 1,
            (false, true) => matrix.fp += 1,
            (true, false) => matrix.fn_ += 1,
            (true, true) => matrix.tp += 1,
        }
    }
    Ok(matrix)
}

mod infinite_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|value| value.is_finite().then_some(*value))
            .collect::<Vec<Option<f64>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .map(|value| value.unwrap_or(f64::INFINITY))
            .collect())
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
