//! Segmentation losses and metrics
//!
//! All reductions are over every element of the `[batch, channels, height,
//! width]` maps. The Dice coefficient is computed per sample and then averaged
//! over the batch.

use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::model::unet::SegmentationOutput;

/// Additive smoothing for the Dice coefficient
pub const DICE_SMOOTH: f64 = 1e-7;

/// Probabilities are clamped to `[EPSILON, 1 - EPSILON]` before taking logs
pub const EPSILON: f64 = 1e-7;

/// Objective optimized during training
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LossKind {
    /// Mean pixel-wise binary cross-entropy
    #[default]
    BinaryCrossEntropy,
    /// `-ln(dice)`
    DiceLog,
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossKind::BinaryCrossEntropy => write!(f, "binary cross-entropy"),
            LossKind::DiceLog => write!(f, "-log(dice)"),
        }
    }
}

/// Mean binary cross-entropy computed from logits
///
/// Uses `max(x, 0) - x * z + ln(1 + exp(-|x|))`, which never overflows.
pub fn sigmoid_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let positive = logits.clone().clamp_min(0.0);
    let soft = logits.clone().abs().neg().exp().log1p();
    (positive - logits * targets + soft).mean()
}

/// Mean binary cross-entropy computed from probabilities
pub fn binary_cross_entropy<B: Backend>(
    probabilities: Tensor<B, 4>,
    targets: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let p = probabilities.clamp(EPSILON, 1.0 - EPSILON);
    let positive = targets.clone() * p.clone().log();
    let negative = targets.neg().add_scalar(1.0) * p.neg().add_scalar(1.0).log();
    (positive + negative).neg().mean()
}

/// Batch-mean Dice coefficient `(2 * sum(p * g) + s) / (sum(p) + sum(g) + s)`
pub fn dice_coefficient<B: Backend>(
    predictions: Tensor<B, 4>,
    targets: Tensor<B, 4>,
    smooth: f64,
) -> Tensor<B, 1> {
    let [batch, channels, height, width] = predictions.dims();
    let flat = channels * height * width;
    let p = predictions.reshape([batch, flat]);
    let g = targets.reshape([batch, flat]);

    let intersection = (p.clone() * g.clone()).sum_dim(1);
    let total = p.sum_dim(1) + g.sum_dim(1);
    let dice = intersection.mul_scalar(2.0).add_scalar(smooth) / total.add_scalar(smooth);
    dice.mean()
}

/// `-ln(dice)`
pub fn dice_loss<B: Backend>(
    predictions: Tensor<B, 4>,
    targets: Tensor<B, 4>,
    smooth: f64,
) -> Tensor<B, 1> {
    dice_coefficient(predictions, targets, smooth).log().neg()
}

/// Fraction of pixels whose thresholded prediction equals the target
pub fn binary_accuracy<B: Backend>(
    probabilities: Tensor<B, 4>,
    targets: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let predicted = probabilities.greater_elem(0.5);
    let actual = targets.greater_elem(0.5);
    predicted.equal(actual).float().mean()
}

/// Training objective for a network output
///
/// Cross-entropy uses the logits form when logits are available and falls
/// back to the probability form when the sigmoid is fused into the network.
pub fn segmentation_loss<B: Backend>(
    output: &SegmentationOutput<B>,
    targets: Tensor<B, 4>,
    kind: LossKind,
) -> Tensor<B, 1> {
    match kind {
        LossKind::BinaryCrossEntropy => match &output.logits {
            Some(logits) => sigmoid_cross_entropy_with_logits(logits.clone(), targets),
            None => binary_cross_entropy(output.probabilities.clone(), targets),
        },
        LossKind::DiceLog => dice_loss(output.probabilities.clone(), targets, DICE_SMOOTH),
    }
}

/// Read a one-element tensor back to the host
pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{activation::sigmoid, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tensor(values: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_floats(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn test_logits_bce_matches_probability_bce() {
        let logits = tensor(vec![0.0, 2.0, -2.0, 0.0], [1, 1, 2, 2]);
        let targets = tensor(vec![1.0, 1.0, 0.0, 0.0], [1, 1, 2, 2]);

        let from_logits =
            scalar(sigmoid_cross_entropy_with_logits(logits.clone(), targets.clone()));
        let from_probs = scalar(binary_cross_entropy(sigmoid(logits), targets));

        assert!((from_logits - 0.410038).abs() < 1e-4, "got {}", from_logits);
        assert!((from_logits - from_probs).abs() < 1e-4);
    }

    #[test]
    fn test_logits_bce_is_stable_for_large_inputs() {
        let logits = tensor(vec![100.0, -100.0], [1, 1, 1, 2]);
        let targets = tensor(vec![1.0, 0.0], [1, 1, 1, 2]);
        let loss = scalar(sigmoid_cross_entropy_with_logits(logits, targets));
        assert!(loss.is_finite());
        assert!(loss < 1e-6);
    }

    #[test]
    fn test_dice_identical_masks() {
        let mask = tensor(vec![1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0], [2, 1, 2, 2]);
        let dice = scalar(dice_coefficient(mask.clone(), mask, DICE_SMOOTH));
        assert!((dice - 1.0).abs() < 1e-5, "got {}", dice);
    }

    #[test]
    fn test_dice_disjoint_masks() {
        let p = tensor(vec![1.0, 1.0, 0.0, 0.0], [1, 1, 2, 2]);
        let g = tensor(vec![0.0, 0.0, 1.0, 1.0], [1, 1, 2, 2]);
        let dice = scalar(dice_coefficient(p, g, DICE_SMOOTH));
        assert!(dice < 0.5);
        assert!(dice < 1e-6);
    }

    #[test]
    fn test_dice_all_background_is_perfect() {
        let empty = tensor(vec![0.0; 4], [1, 1, 2, 2]);
        let dice = scalar(dice_coefficient(empty.clone(), empty, DICE_SMOOTH));
        assert!((dice - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_dice_is_averaged_per_sample() {
        // Sample 0 matches perfectly, sample 1 is disjoint
        let p = tensor(vec![1.0, 0.0, 1.0, 0.0], [2, 1, 1, 2]);
        let g = tensor(vec![1.0, 0.0, 0.0, 1.0], [2, 1, 1, 2]);
        let dice = scalar(dice_coefficient(p, g, DICE_SMOOTH));
        assert!((dice - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_dice_loss_is_negative_log() {
        let p = tensor(vec![1.0, 1.0, 0.0, 0.0], [1, 1, 2, 2]);
        let g = tensor(vec![1.0, 0.0, 0.0, 0.0], [1, 1, 2, 2]);
        // dice = 2 * 1 / (2 + 1)
        let loss = scalar(dice_loss(p, g, DICE_SMOOTH));
        assert!((loss - (1.5f64).ln()).abs() < 1e-4);
    }

    #[test]
    fn test_binary_accuracy() {
        let p = tensor(vec![0.9, 0.2, 0.6, 0.4], [1, 1, 2, 2]);
        let g = tensor(vec![1.0, 0.0, 0.0, 0.0], [1, 1, 2, 2]);
        let acc = scalar(binary_accuracy(p, g));
        assert!((acc - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_segmentation_loss_dispatch() {
        let logits = tensor(vec![0.0, 2.0, -2.0, 0.0], [1, 1, 2, 2]);
        let targets = tensor(vec![1.0, 1.0, 0.0, 0.0], [1, 1, 2, 2]);
        let with_logits = SegmentationOutput {
            logits: Some(logits.clone()),
            probabilities: sigmoid(logits.clone()),
        };
        let fused = SegmentationOutput {
            logits: None,
            probabilities: sigmoid(logits),
        };

        let bce = LossKind::BinaryCrossEntropy;
        let a = scalar(segmentation_loss(&with_logits, targets.clone(), bce));
        let b = scalar(segmentation_loss(&fused, targets.clone(), bce));
        assert!((a - b).abs() < 1e-4);

        let d = scalar(segmentation_loss(&fused, targets, LossKind::DiceLog));
        assert!(d > 0.0);
    }
}
