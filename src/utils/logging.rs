//! Logging Module
//!
//! Structured logging with the `tracing` crate, plus an optional
//! execution-trace layer that records spans in the Chrome trace-event
//! JSON format (load the file in `chrome://tracing` or Perfetto).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use tracing::Level;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{
    filter::filter_fn, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::utils::error::{Result, UNetError};

/// Open trace file and the guard that flushes it on drop.
static TRACE_SLOT: OnceLock<Mutex<Option<(PathBuf, FlushGuard)>>> = OnceLock::new();

/// Cleared once the trace is exported so later spans skip the closed writer.
static TRACE_RECORDING: AtomicBool = AtomicBool::new(false);

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
    /// Where to write the execution trace, if anywhere
    pub trace_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
            trace_file: None,
        }
    }
}

impl LogConfig {
    /// Create a verbose logging config for debugging
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            timestamps: true,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
            trace_file: None,
        }
    }

    /// Create a quiet logging config (errors only)
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            timestamps: false,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
            trace_file: None,
        }
    }

    /// Record spans to a Chrome trace file
    pub fn with_trace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_file = Some(path.into());
        self
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Create from string
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Initialize logging with the given configuration
///
/// `RUST_LOG` overrides the configured level when set. When
/// `config.trace_file` is present, every span is also recorded to that file
/// until [`export_trace`] is called.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_tracing_level().as_str()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact();
    let fmt_layer = if config.timestamps {
        fmt_layer.boxed()
    } else {
        fmt_layer.without_time().boxed()
    };

    let chrome_layer = match &config.trace_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let (layer, guard) = ChromeLayerBuilder::new()
                .file(path.clone())
                .include_args(true)
                .build();
            let slot = TRACE_SLOT.get_or_init(|| Mutex::new(None));
            if let Ok(mut slot) = slot.lock() {
                *slot = Some((path.clone(), guard));
            }
            TRACE_RECORDING.store(true, Ordering::SeqCst);
            Some(layer.with_filter(filter_fn(|_| TRACE_RECORDING.load(Ordering::SeqCst))))
        }
        None => None,
    };

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(chrome_layer)
        .try_init()
        .map_err(|e| UNetError::Config(format!("Failed to initialize logging: {}", e)))
}

/// Flush and close the execution trace
///
/// Returns the path of the written trace file, or `None` when no trace was
/// being recorded (or it was already exported). Spans opened afterwards are
/// still logged but no longer traced.
pub fn export_trace() -> Option<PathBuf> {
    let slot = TRACE_SLOT.get()?;
    TRACE_RECORDING.store(false, Ordering::SeqCst);
    let (path, guard) = slot.lock().ok()?.take()?;
    guard.flush();
    drop(guard);
    tracing::info!("Saved execution trace to {}", path.display());
    Some(path)
}

/// Trace file name for a run, keyed by the scheduling knobs
pub fn trace_file_name(
    blocktime: &str,
    intra_op_threads: usize,
    inter_op_threads: usize,
) -> String {
    format!(
        "timeline_unet_{}_{}_{}.json",
        blocktime, intra_op_threads, inter_op_threads
    )
}


/// Training progress logger
pub struct TrainingLogger {
    /// Current epoch
    epoch: usize,
    /// Total epochs
    total_epochs: usize,
    /// Epoch start time
    epoch_start: Instant,
    /// Training start time
    training_start: Instant,
}

impl TrainingLogger {
    /// Create a new training logger
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    /// Log start of an epoch
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();

        tracing::info!("Epoch {}/{} started", epoch + 1, self.total_epochs);
    }

    /// Log end of an epoch with its training loss
    pub fn end_epoch(&self, train_loss: f64, samples: usize) {
        let epoch_time = self.epoch_start.elapsed();
        let total_time = self.training_start.elapsed();

        let epochs_remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg_epoch_time = total_time.as_secs_f64() / (self.epoch + 1) as f64;
        let eta_secs = epochs_remaining as f64 * avg_epoch_time;

        tracing::info!(
            "Epoch {}/{} completed in {:.1}s | {} samples | Train loss: {:.6} | ETA: {:.0}s",
            self.epoch + 1,
            self.total_epochs,
            epoch_time.as_secs_f64(),
            samples,
            train_loss,
            eta_secs
        );
    }

    /// Log an evaluation pass
    pub fn log_evaluation(&self, loss: f64, dice: f64, accuracy: f64) {
        tracing::info!(
            "Epoch: {}, test loss = {:.6}, (Continuous) Dice coefficient = {:.6}, accuracy = {:.4}",
            self.epoch + 1,
            loss,
            dice,
            accuracy
        );
    }

    /// Log a new best model
    pub fn log_new_best(&self, loss: f64, path: &Path) {
        tracing::info!(
            "New best test loss {:.6}; model weights saved in file: {}",
            loss,
            path.display()
        );
    }

    /// Log a skipped checkpoint
    pub fn log_no_improvement(&self, loss: f64, best: f64) {
        tracing::info!(
            "Test loss {:.6} did not improve on {:.6}; keeping previous checkpoint",
            loss,
            best
        );
    }

    /// Log training completion
    pub fn log_complete(&self, best_loss: f64) {
        let total_time = self.training_start.elapsed();

        tracing::info!(
            "Training finished. {} epochs in {:.1}s | Best test loss: {:.6}",
            self.total_epochs,
            total_time.as_secs_f64(),
            best_loss
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from_str("Warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.timestamps);
        assert!(config.trace_file.is_none());
    }

    #[test]
    fn test_trace_file_name() {
        assert_eq!(trace_file_name("30", 34, 1), "timeline_unet_30_34_1.json");
    }

    #[test]
    fn test_export_without_trace_is_none() {
        assert!(export_trace().is_none());
    }
}
