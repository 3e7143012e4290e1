//! Metrics Module for Segmentation Evaluation
//!
//! Host-side bookkeeping for the per-batch loss, Dice coefficient and pixel
//! accuracy values produced by the training loop.

use serde::{Deserialize, Serialize};

/// Aggregated evaluation results over one pass of a split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Mean loss over batches
    pub loss: f64,
    /// Mean (continuous) Dice coefficient over batches
    pub dice: f64,
    /// Mean binary pixel accuracy over batches
    pub accuracy: f64,
    /// Number of batches that contributed
    pub batches: usize,
    /// Number of samples that contributed
    pub samples: usize,
}

impl Default for EvaluationMetrics {
    fn default() -> Self {
        Self {
            loss: f64::NAN,
            dice: 0.0,
            accuracy: 0.0,
            batches: 0,
            samples: 0,
        }
    }
}

impl std::fmt::Display for EvaluationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loss = {:.6}, dice = {:.6}, accuracy = {:.4} ({} samples)",
            self.loss, self.dice, self.accuracy, self.samples
        )
    }
}

/// Running sums of per-batch metric values
///
/// Every batch counts once regardless of its size, so a trailing partial
/// batch weighs as much as a full one.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    dice_sum: f64,
    accuracy_sum: f64,
    batches: usize,
    samples: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the metrics of one batch
    pub fn push(&mut self, loss: f64, dice: f64, accuracy: f64, batch_len: usize) {
        self.loss_sum += loss;
        self.dice_sum += dice;
        self.accuracy_sum += accuracy;
        self.batches += 1;
        self.samples += batch_len;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Mean loss so far, NaN before the first batch
    pub fn mean_loss(&self) -> f64 {
        if self.batches == 0 {
            f64::NAN
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    /// Finish into averaged metrics
    pub fn finish(&self) -> EvaluationMetrics {
        if self.batches == 0 {
            return EvaluationMetrics::default();
        }
        let n = self.batches as f64;
        EvaluationMetrics {
            loss: self.loss_sum / n,
            dice: self.dice_sum / n,
            accuracy: self.accuracy_sum / n,
            batches: self.batches,
            samples: self.samples,
        }
    }
}
