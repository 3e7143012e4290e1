//! End-to-end training run
//!
//! Loads and remaps both splits, builds or restores the network, trains it,
//! then predicts and scores the test split.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use burn::{
    module::{AutodiffModule, Module},
    tensor::backend::AutodiffBackend,
};
use colored::Colorize;
use tracing::{info, warn};

use crate::backend::BackendRuntime;
use crate::dataset::loader::{prepare_split, PrepareOptions, TEST_SUFFIX, TRAIN_SUFFIX};
use crate::inference::predictor::{save_predictions, Predictor};
use crate::model::config::{ModelDescription, TrainingConfig};
use crate::training::checkpoint::{CheckpointStore, RestoreOutcome};
use crate::training::trainer::{adam_trainer, evaluate_model};
use crate::utils::error::Result;
use crate::utils::logging::export_trace;
use crate::utils::metrics::EvaluationMetrics;
use crate::utils::{format_duration, format_shape};

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Epochs completed
    pub epochs: usize,
    /// Lowest test loss seen during training
    pub best_loss: f64,
    /// Epochs after which the best checkpoint was written
    pub checkpoints_written: Vec<usize>,
    /// Scores of the predicting model on the test split
    pub final_metrics: EvaluationMetrics,
    pub restore: RestoreOutcome,
    pub best_checkpoint: Option<PathBuf>,
    pub model_json: PathBuf,
    pub predictions: PathBuf,
    /// Per-epoch training history JSON
    pub history: PathBuf,
    pub trace: Option<PathBuf>,
    /// Wall-clock seconds for the whole run
    pub elapsed_secs: f64,
}

/// Train, predict and evaluate according to `config`
pub fn run_training<B: AutodiffBackend>(
    config: &TrainingConfig,
    runtime: &BackendRuntime,
    device: B::Device,
) -> Result<RunSummary> {
    let run_start = Instant::now();
    config.validate()?;
    fs::create_dir_all(&config.output_dir)?;

    println!("{}", "Loading Data...".cyan().bold());
    let options = PrepareOptions {
        input_no: config.input_channels,
        output_no: config.output_channels,
        mode: config.segmentation_mode(),
        max_samples: config.max_samples,
    };
    let phase_start = Instant::now();
    let train = prepare_split(&config.data_dir, TRAIN_SUFFIX, options, runtime)?;
    let test = prepare_split(&config.data_dir, TEST_SUFFIX, options, runtime)?;
    info!(
        "Training images {} masks {} | test images {} masks {}",
        format_shape(&train.images().shape()),
        format_shape(&train.masks().shape()),
        format_shape(&test.images().shape()),
        format_shape(&test.masks().shape())
    );
    info!("Data loaded in {}", format_duration(phase_start.elapsed().as_secs_f64()));

    println!("{}", "Building Model...".cyan().bold());
    let unet_config = config.unet_config();
    let store = CheckpointStore::new(&config.output_dir, &config.model_name);
    let (model, restore) = store.restore_or_init::<B>(&unet_config, config.restore, &device)?;

    let model_json = config.model_json_path();
    ModelDescription::from_config(&config.model_name, &unet_config, model.num_params())
        .save(&model_json)?;
    info!(
        "Model has {} parameters; definition written to {}",
        model.num_params(),
        model_json.display()
    );

    println!("{}", "Training...".cyan().bold());
    let phase_start = Instant::now();
    let mut trainer = adam_trainer(model, config.clone(), device.clone());
    let state = trainer.run(&train, &test, &store)?;
    let epochs = state.epoch;
    let best_loss = state.best_loss();
    let checkpoints_written = state.checkpoints_written.clone();
    if let Some(last) = state.last_eval() {
        info!("Last evaluation after epoch {}: {}", last.epoch, last.metrics);
    }
    info!("Training finished in {}", format_duration(phase_start.elapsed().as_secs_f64()));

    let trace = export_trace();

    println!("{}", "Predicting Masks...".cyan().bold());
    let final_model = trainer.model.valid();
    let model = if config.predict_from_best {
        match store.load_best::<B::InnerBackend>(&unet_config, &device) {
            Ok(best) => best,
            Err(e) => {
                warn!("Cannot load best checkpoint ({}); predicting with final weights", e);
                final_model
            }
        }
    } else {
        final_model
    };

    let predictor = Predictor::new(model, config.batch_size, device.clone())?;
    let predictions = predictor.predict(test.images())?;
    let predictions_path = config.predictions_path();
    save_predictions(&predictions, &predictions_path)?;

    let final_metrics = evaluate_model(predictor.model(), &test, config, &device)?;
    println!("{}", "Evaluation Scores".green().bold());
    println!("  {}", final_metrics);

    let elapsed_secs = run_start.elapsed().as_secs_f64();
    info!("Total time elapsed for program = {}", format_duration(elapsed_secs));

    Ok(RunSummary {
        epochs,
        best_loss,
        best_checkpoint: store.has_best().then(|| store.best_path()),
        checkpoints_written,
        final_metrics,
        restore,
        model_json,
        predictions: predictions_path,
        history: config.history_path(),
        trace,
        elapsed_secs,
    })
}
