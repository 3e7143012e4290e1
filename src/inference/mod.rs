//! Inference module for mask prediction
//!
//! This module provides:
//! - Batched prediction over a whole split
//! - Saving predicted probability maps as `.npy`

pub mod predictor;

// Re-export main types for convenience
pub use predictor::{save_predictions, Predictor};

/// Default prediction output file name
pub const DEFAULT_PREDICTIONS_FILE: &str = "msks_pred.npy";
