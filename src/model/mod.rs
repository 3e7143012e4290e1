//! Model module for the U-Net segmentation network using the Burn framework
//!
//! This module provides:
//! - The encoder-decoder architecture with skip connections
//! - Run configuration and the exported model description

pub mod config;
pub mod unet;

// Re-export main types for convenience
pub use config::{LayerSpec, ModelDescription, OutputActivation, TrainingConfig, UpsampleMode};
pub use unet::{SegmentationOutput, UNet, UNetConfig};

/// Default dropout rate in the shallow decoder stages
pub const DEFAULT_DROPOUT: f64 = 0.2;

/// Default encoder filter schedule
pub const DEFAULT_FILTERS: [usize; 5] = [32, 64, 128, 256, 512];
