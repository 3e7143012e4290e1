//! Training Loop for U-Net Segmentation
//!
//! This module implements the training state machine using the Burn
//! framework:
//! - Forward/backward passes with automatic differentiation
//! - Full batches plus a trailing partial batch, every sample once per epoch
//! - Periodic evaluation on held-out data
//! - Checkpointing only on strict improvement of the test loss

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, info_span};

use crate::dataset::batcher::{
    BatchPlan, SegmentationBatch, SegmentationBatcher, SegmentationDataset,
};
use crate::model::config::TrainingConfig;
use crate::model::unet::UNet;
use crate::training::checkpoint::{CheckpointMetadata, CheckpointStore};
use crate::training::loss::{
    binary_accuracy, dice_coefficient, scalar, segmentation_loss, DICE_SMOOTH,
};
use crate::utils::error::Result;
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::{EvaluationMetrics, MetricAccumulator};

/// Where the training loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    /// Model built or restored, nothing trained yet
    Init,
    /// Iterating training batches
    EpochRunning,
    /// Evaluating on held-out data
    EpochEval,
    /// Deciding whether to persist the weights
    CheckpointDecision,
    /// All epochs finished
    Done,
}

/// Lowest test loss seen in this process
///
/// Serializes as `null` until the first evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BestLossTracker {
    best: f64,
}

impl Default for BestLossTracker {
    fn default() -> Self {
        Self { best: f64::INFINITY }
    }
}

impl BestLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `loss`; true only when it is strictly below the best so far
    pub fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

/// One evaluation pass and what came of it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalRecord {
    /// 1-based epoch after which the evaluation ran
    pub epoch: usize,
    pub metrics: EvaluationMetrics,
    /// Whether the checkpoint was overwritten
    pub improved: bool,
}

/// Training state carried through the state machine
#[derive(Debug, Clone, Serialize)]
pub struct TrainingState {
    pub phase: TrainingPhase,
    /// Completed epochs
    pub epoch: usize,
    /// Optimizer steps taken
    pub iteration: usize,
    /// Total training samples seen
    pub samples_seen: usize,
    pub best: BestLossTracker,
    /// Loss of every optimizer step, in order
    pub step_losses: Vec<f64>,
    /// Mean training loss per epoch
    pub train_losses: Vec<f64>,
    pub eval_history: Vec<EvalRecord>,
    /// 1-based epochs after which the best checkpoint was written
    pub checkpoints_written: Vec<usize>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            phase: TrainingPhase::Init,
            epoch: 0,
            iteration: 0,
            samples_seen: 0,
            best: BestLossTracker::new(),
            step_losses: Vec::new(),
            train_losses: Vec::new(),
            eval_history: Vec::new(),
            checkpoints_written: Vec::new(),
        }
    }
}

impl TrainingState {
    pub fn best_loss(&self) -> f64 {
        self.best.best()
    }

    pub fn last_eval(&self) -> Option<&EvalRecord> {
        self.eval_history.last()
    }

    /// Write the state as a JSON history file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Result of one optimizer step
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub loss: f64,
    pub batch_len: usize,
}

/// Result of one training epoch
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    /// 1-based epoch number
    pub epoch: usize,
    pub mean_loss: f64,
    pub batches: usize,
    pub samples: usize,
}

/// Main trainer for the U-Net model using Burn
pub struct Trainer<B: AutodiffBackend, O: Optimizer<UNet<B>, B>> {
    /// Model being trained
    pub model: UNet<B>,
    optimizer: O,
    /// Training configuration
    pub config: TrainingConfig,
    /// Current training state
    pub state: TrainingState,
    /// Device to train on
    device: B::Device,
}

/// Trainer with the Adam optimizer used for every run
pub fn adam_trainer<B: AutodiffBackend>(
    model: UNet<B>,
    config: TrainingConfig,
    device: B::Device,
) -> Trainer<B, impl Optimizer<UNet<B>, B>> {
    let optimizer = AdamConfig::new().init::<B, UNet<B>>();
    Trainer::new(model, optimizer, config, device)
}

impl<B: AutodiffBackend, O: Optimizer<UNet<B>, B>> Trainer<B, O> {
    /// Create a new trainer with the given model and configuration
    pub fn new(model: UNet<B>, optimizer: O, config: TrainingConfig, device: B::Device) -> Self {
        Self {
            model,
            optimizer,
            config,
            state: TrainingState::default(),
            device,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Forward, loss, backward and one optimizer step
    pub fn train_step(&mut self, batch: SegmentationBatch<B>) -> Result<StepStats> {
        let _span = info_span!("train_step", iteration = self.state.iteration).entered();
        let batch_len = batch.images.dims()[0];

        let output = self.model.forward(batch.images)?;
        let loss = segmentation_loss(&output, batch.masks, self.config.loss);
        let loss_value = scalar(loss.clone());

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);

        self.state.iteration += 1;
        self.state.samples_seen += batch_len;
        self.state.step_losses.push(loss_value);

        Ok(StepStats {
            loss: loss_value,
            batch_len,
        })
    }

    /// Train for one epoch
    ///
    /// Full batches run first, in the configured epoch order, followed by the
    /// partial batch when the sample count is not a multiple of the batch size.
    pub fn train_epoch(&mut self, dataset: &SegmentationDataset) -> Result<EpochStats> {
        self.state.phase = TrainingPhase::EpochRunning;
        let epoch = self.state.epoch + 1;
        let plan = BatchPlan::new(dataset.len(), self.config.batch_size)?;
        let order = self.config.epoch_order().indices(dataset.len(), self.state.epoch);
        let batcher = SegmentationBatcher::<B>::for_dataset(self.device.clone(), dataset);

        info!(
            "Training epoch {} with {} full batches of {} and a partial batch of {}",
            epoch,
            plan.full_batches(),
            plan.batch_size(),
            plan.partial_len()
        );

        let progress = ProgressBar::new(plan.num_batches() as u64);
        let template =
            "  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches {msg}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            progress.set_style(style.progress_chars("#>-"));
        }

        let mut acc = MetricAccumulator::new();
        for (batch_idx, range) in plan.ranges().enumerate() {
            let batch = batcher.batch(dataset.items(&order[range])?);
            let stats = self.train_step(batch)?;
            acc.push(stats.loss, 0.0, 0.0, stats.batch_len);

            progress.inc(1);
            progress.set_message(format!("loss = {:.4}", stats.loss));
            debug!(
                "  Batch {}/{}: {} samples, loss = {:.6}",
                batch_idx + 1,
                plan.num_batches(),
                stats.batch_len,
                stats.loss
            );
        }
        progress.finish_and_clear();

        let mean_loss = acc.mean_loss();
        self.state.train_losses.push(mean_loss);

        Ok(EpochStats {
            epoch,
            mean_loss,
            batches: acc.batches(),
            samples: acc.samples(),
        })
    }

    /// Evaluate on a held-out set
    ///
    /// Uses the inner (non-autodiff) model, so dropout is disabled. Loss, Dice
    /// and accuracy are averaged over batches.
    pub fn evaluate(&self, dataset: &SegmentationDataset) -> Result<EvaluationMetrics> {
        evaluate_model(&self.model.valid(), dataset, &self.config, &self.device)
    }

    /// Run the configured number of epochs
    ///
    /// Every `eval_every` epochs (and after the last one) the model is
    /// evaluated on `test`; the best checkpoint is overwritten only when the
    /// test loss strictly improves. The final state is written to
    /// [`TrainingConfig::history_path`].
    pub fn run(
        &mut self,
        train: &SegmentationDataset,
        test: &SegmentationDataset,
        checkpoints: &CheckpointStore,
    ) -> Result<&TrainingState> {
        self.state.phase = TrainingPhase::Init;
        let total_epochs = self.config.epochs;
        let mut logger = TrainingLogger::new(total_epochs);

        while self.state.epoch < total_epochs {
            logger.start_epoch(self.state.epoch);
            let stats = self.train_epoch(train)?;
            self.state.epoch = stats.epoch;
            logger.end_epoch(stats.mean_loss, stats.samples);

            if self.config.save_every_epoch {
                checkpoints.save_epoch(&self.model, stats.epoch)?;
            }

            let last_epoch = stats.epoch == total_epochs;
            if stats.epoch % self.config.eval_every.max(1) != 0 && !last_epoch {
                continue;
            }

            self.state.phase = TrainingPhase::EpochEval;
            let metrics = self.evaluate(test)?;
            logger.log_evaluation(metrics.loss, metrics.dice, metrics.accuracy);

            self.state.phase = TrainingPhase::CheckpointDecision;
            let previous_best = self.state.best.best();
            let improved = self.state.best.observe(metrics.loss);
            if improved {
                let metadata = CheckpointMetadata::new(
                    &self.config.model_name,
                    stats.epoch,
                    self.state.iteration,
                    metrics.loss,
                    metrics.dice,
                    self.config.unet_config(),
                );
                let path = checkpoints.save_best(&self.model, &metadata)?;
                self.state.checkpoints_written.push(stats.epoch);
                logger.log_new_best(metrics.loss, &path);
            } else {
                logger.log_no_improvement(metrics.loss, previous_best);
            }

            self.state.eval_history.push(EvalRecord {
                epoch: stats.epoch,
                metrics,
                improved,
            });
        }

        self.state.phase = TrainingPhase::Done;
        logger.log_complete(self.state.best.best());

        let history = self.config.history_path();
        self.state.save(&history)?;
        info!("Training history written to {}", history.display());
        Ok(&self.state)
    }
}

/// Evaluate a non-autodiff model on `dataset`
pub fn evaluate_model<B: burn::tensor::backend::Backend>(
    model: &UNet<B>,
    dataset: &SegmentationDataset,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<EvaluationMetrics> {
    let _span = info_span!("evaluate", samples = dataset.len()).entered();
    let plan = BatchPlan::new(dataset.len(), config.batch_size)?;
    let batcher = SegmentationBatcher::<B>::for_dataset(device.clone(), dataset);
    let indices: Vec<usize> = (0..dataset.len()).collect();

    let mut acc = MetricAccumulator::new();
    for range in plan.ranges() {
        let batch_len = range.len();
        let batch = batcher.batch(dataset.items(&indices[range])?);
        let output = model.forward(batch.images)?;

        let loss = scalar(segmentation_loss(&output, batch.masks.clone(), config.loss));
        let dice = scalar(dice_coefficient(
            output.probabilities.clone(),
            batch.masks.clone(),
            DICE_SMOOTH,
        ));
        let accuracy = scalar(binary_accuracy(output.probabilities, batch.masks));
        acc.push(loss, dice, accuracy, batch_len);
    }

    Ok(acc.finish())
}
