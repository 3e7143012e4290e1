//! Tumor U-Net CLI
//!
//! Trains a U-Net on pre-processed brain MRI slices, predicts masks for the
//! test split and reports Dice scores.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::info;

use tumor_unet::backend::{backend_name, default_device, init_backend, TrainingBackend};
use tumor_unet::model::config::{TrainingConfig, UpsampleMode};
use tumor_unet::training::run::{run_training, RunSummary};
use tumor_unet::utils::logging::{init_logging, trace_file_name, LogConfig, LogLevel};

/// U-Net brain tumor segmentation trainer
///
/// Reads `imgs_train.npy`, `msks_train.npy`, `imgs_test.npy` and
/// `msks_test.npy` from the data directory. Flags override values loaded
/// with `--config`.
#[derive(Parser, Debug)]
#[command(name = "tumor_unet")]
#[command(version)]
#[command(about = "U-Net brain tumor segmentation with Burn", long_about = None)]
struct Cli {
    /// JSON training configuration to start from
    #[arg(long)]
    config: Option<PathBuf>,

    /// Intra-op threads (0 = all cores)
    #[arg(long = "num_threads")]
    num_threads: Option<usize>,

    /// Inter-op threads
    #[arg(long = "num_intra_threads")]
    num_intra_threads: Option<usize>,

    /// Worker blocktime in milliseconds (above 1000 = infinite)
    #[arg(long)]
    blocktime: Option<u64>,

    /// Batch size for training, evaluation and prediction
    #[arg(long = "batch_size")]
    batch_size: Option<usize>,

    /// Use nearest-neighbour upsampling instead of transposed convolutions
    #[arg(long = "use_upsampling", default_value = "false")]
    use_upsampling: bool,

    /// Directory holding the `.npy` splits
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Directory for checkpoints, predictions and traces
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Number of training epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// 1 whole tumor, 2 enhancing tumor, 3 active core, anything else copies channels
    #[arg(short, long, allow_negative_numbers = true)]
    mode: Option<i32>,

    /// Adam learning rate
    #[arg(short, long)]
    learning_rate: Option<f64>,

    /// Shuffle training samples every epoch
    #[arg(long, default_value = "false")]
    shuffle: bool,

    /// Seed for shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Start from fresh weights even if a checkpoint exists
    #[arg(long, default_value = "false")]
    no_restore: bool,

    /// Do not record an execution trace
    #[arg(long, default_value = "false")]
    no_trace: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error); overrides -v/-q
    #[arg(long)]
    log_level: Option<String>,

    /// Write the effective configuration to this file
    #[arg(long)]
    save_config: Option<PathBuf>,
}

impl Cli {
    fn log_config(&self) -> LogConfig {
        let mut config = if self.quiet {
            LogConfig::quiet()
        } else if self.verbose {
            LogConfig::verbose()
        } else {
            LogConfig::default()
        };
        if let Some(level) = &self.log_level {
            config.level = LogLevel::from_str(level);
        }
        config
    }

    fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => TrainingConfig::default(),
        };

        if let Some(n) = self.num_threads {
            config.threads.intra_op_threads = n;
        }
        if let Some(n) = self.num_intra_threads {
            config.threads.inter_op_threads = n;
        }
        if let Some(ms) = self.blocktime {
            config.threads.blocktime_ms = ms;
        }
        if let Some(bs) = self.batch_size {
            config.batch_size = bs;
        }
        if self.use_upsampling {
            config.upsample = UpsampleMode::Nearest;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if self.shuffle {
            config.shuffle = true;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.no_restore {
            config.restore = false;
        }
        if self.no_trace {
            config.trace = false;
        }

        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.training_config()?;

    if let Some(path) = &cli.save_config {
        config
            .save(path)
            .with_context(|| format!("Failed to save config {}", path.display()))?;
    }

    let mut log_config = cli.log_config();
    if config.trace {
        std::fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;
        let name = trace_file_name(
            &config.threads.blocktime_label(),
            config.threads.effective_intra_op_threads(),
            config.threads.effective_inter_op_threads(),
        );
        log_config = log_config.with_trace_file(config.output_dir.join(name));
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("{} {}", "Warning:".yellow(), e);
    }

    print_banner();
    info!("Backend: {}", backend_name());
    info!(
        "Data: {} | output: {} | mode: {} | batch size: {} | epochs: {}",
        config.data_dir.display(),
        config.output_dir.display(),
        config.segmentation_mode(),
        config.batch_size,
        config.epochs
    );

    let runtime = init_backend(&config.threads)?;
    let summary = run_training::<TrainingBackend>(&config, &runtime, default_device())?;
    print_summary(&summary);

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ============================================================
   Tumor U-Net
   Brain tumor segmentation with Burn + Rust
 ============================================================
  "#
        .green()
    );
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Run Summary".green().bold());
    println!("  Epochs:           {}", summary.epochs);
    println!("  Best test loss:   {:.6}", summary.best_loss);
    println!("  Checkpoints:      {:?}", summary.checkpoints_written);
    println!("  Test Dice:        {:.4}", summary.final_metrics.dice);
    println!("  Test accuracy:    {:.4}", summary.final_metrics.accuracy);
    println!("  Model definition: {}", summary.model_json.display());
    println!("  Predictions:      {}", summary.predictions.display());
    println!("  History:          {}", summary.history.display());
    if let Some(trace) = &summary.trace {
        println!("  Trace:            {}", trace.display());
    }
    println!("  Elapsed:          {:.1}s", summary.elapsed_secs);
}
