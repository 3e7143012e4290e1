//! Training module for U-Net segmentation
//!
//! This module provides:
//! - Segmentation losses and metrics
//! - The epoch/evaluation/checkpoint state machine
//! - Checkpoint persistence and restore
//! - The end-to-end training run

pub mod checkpoint;
pub mod loss;
pub mod run;
pub mod trainer;

// Re-export main types for convenience
pub use checkpoint::{CheckpointMetadata, CheckpointStore, RestoreOutcome};
pub use loss::LossKind;
pub use run::{run_training, RunSummary};
pub use trainer::{
    adam_trainer, evaluate_model, BestLossTracker, Trainer, TrainingPhase, TrainingState,
};

// Re-export TrainingConfig from model::config where it's defined
pub use crate::model::config::TrainingConfig;
