//! # Tumor U-Net
//!
//! A Rust library for training a 2D U-Net that segments brain tumors in MRI
//! slices, using the Burn framework.
//!
//! ## Features
//!
//! - **`.npy` ingestion** of NHWC image and mask arrays, memory-mapped
//! - **Mode-driven channel remapping** (whole tumor, enhancing tumor, active core)
//! - **Configurable U-Net** with transposed-convolution or nearest upsampling
//! - **Checkpointing** on strict test-loss improvement, with restore fallback
//! - **Chrome execution traces** of the training run
//!
//! ## Modules
//!
//! - `backend`: Backend selection and thread pool configuration
//! - `dataset`: NPY reading, remapping, batching
//! - `model`: U-Net architecture and run configuration
//! - `training`: Losses, training loop, checkpoints, end-to-end run
//! - `inference`: Batched mask prediction
//! - `utils`: Logging, metrics, and error types
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tumor_unet::backend::{default_device, init_backend, TrainingBackend};
//! use tumor_unet::{run_training, TrainingConfig};
//!
//! let config = TrainingConfig::default();
//! let runtime = init_backend(&config.threads)?;
//! let summary = run_training::<TrainingBackend>(&config, &runtime, default_device())?;
//! ```

pub mod backend;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use backend::{init_backend, BackendRuntime, ThreadConfig};
pub use dataset::{
    SegmentationBatch, SegmentationBatcher, SegmentationDataset, SegmentationMode, Volume,
};
pub use inference::predictor::Predictor;
pub use model::config::TrainingConfig;
pub use model::unet::{UNet, UNetConfig};
pub use training::run::{run_training, RunSummary};
pub use training::trainer::{Trainer, TrainingState};
pub use utils::error::{Result, UNetError};
pub use utils::metrics::EvaluationMetrics;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
