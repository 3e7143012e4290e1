//! Error Handling Module
//!
//! Defines the error taxonomy for the segmentation trainer.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for U-Net training operations
#[derive(Error, Debug)]
pub enum UNetError {
    /// Two arrays or tensors that must agree on their dimensions do not
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Malformed input (wrong channel count, bad mode selection, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed or unsupported `.npy` file
    #[error("NPY format error in '{path}': {reason}")]
    Npy { path: PathBuf, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint save/restore error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Numerical backend failure during a training or inference step
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

impl UNetError {
    /// Build a shape mismatch error from two dimension slices
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Whether the run may continue after this error
    ///
    /// Only checkpoint restore problems are recovered locally; everything
    /// else terminates the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Checkpoint(_))
    }
}

impl From<serde_json::Error> for UNetError {
    fn from(err: serde_json::Error) -> Self {
        UNetError::Serialization(err.to_string())
    }
}

/// Convenience Result type for U-Net training operations
pub type Result<T> = std::result::Result<T, UNetError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| UNetError::InvalidInput(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| UNetError::InvalidInput(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| UNetError::InvalidInput(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| UNetError::InvalidInput(f()))
    }
}
