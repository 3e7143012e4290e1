//! Model Configuration Module
//!
//! Defines the run configuration (data locations, hyperparameters, network
//! shape, thread settings) and the JSON description of the built network.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::ThreadConfig;
use crate::dataset::batcher::EpochOrder;
use crate::dataset::remap::SegmentationMode;
use crate::inference::DEFAULT_PREDICTIONS_FILE;
use crate::model::unet::UNetConfig;
use crate::model::{DEFAULT_DROPOUT, DEFAULT_FILTERS};
use crate::training::loss::LossKind;
use crate::utils::error::{Result, UNetError};

/// How the decoder doubles spatial resolution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UpsampleMode {
    /// Nearest-neighbour repeat, no parameters
    Nearest,
    /// Learned 2x2 transposed convolution with stride 2
    #[default]
    TransposedConv,
}

/// What the 1x1 head emits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OutputActivation {
    /// Raw logits; the loss applies the sigmoid
    #[default]
    Logits,
    /// Sigmoid fused into the network; outputs are probabilities
    Sigmoid,
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Directory holding imgs/msks `_train` and `_test` arrays
    pub data_dir: PathBuf,
    /// Directory for checkpoints, model JSON, predictions and traces
    pub output_dir: PathBuf,
    /// Base name of every artifact written for this model
    pub model_name: String,

    /// Number of training epochs
    pub epochs: usize,
    /// Batch size for training, evaluation and prediction
    pub batch_size: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Evaluate (and consider checkpointing) every N epochs
    pub eval_every: usize,

    /// Mode code: 1 whole tumor, 2 enhancing tumor, 3 active core
    pub mode: i32,
    /// Image channels fed to the network
    pub input_channels: usize,
    /// Mask channels predicted by the network
    pub output_channels: usize,
    /// Only use the first N samples of each split
    pub max_samples: Option<usize>,

    /// Encoder filter schedule, one entry per level
    pub filters: Vec<usize>,
    pub dropout_rate: f64,
    pub upsample: UpsampleMode,
    pub activation: OutputActivation,
    pub loss: LossKind,

    /// Try to resume from the best checkpoint
    pub restore: bool,
    /// Also keep a snapshot after every epoch
    pub save_every_epoch: bool,
    /// Predict with the best checkpoint instead of the final weights
    pub predict_from_best: bool,
    /// Shuffle the training set each epoch
    pub shuffle: bool,
    /// Seed for shuffling
    pub seed: u64,

    /// Prediction output file name, inside `output_dir`
    pub predictions_file: String,
    /// Record a Chrome trace of the run
    pub trace: bool,

    pub threads: ThreadConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
            model_name: "unet_brain".to_string(),
            epochs: 15,
            batch_size: 512,
            learning_rate: 1e-3,
            eval_every: 1,
            mode: 1,
            input_channels: 1,
            output_channels: 1,
            max_samples: None,
            filters: DEFAULT_FILTERS.to_vec(),
            dropout_rate: DEFAULT_DROPOUT,
            upsample: UpsampleMode::TransposedConv,
            activation: OutputActivation::Logits,
            loss: LossKind::BinaryCrossEntropy,
            restore: true,
            save_every_epoch: false,
            predict_from_best: false,
            shuffle: false,
            seed: 42,
            predictions_file: DEFAULT_PREDICTIONS_FILE.to_string(),
            trace: true,
            threads: ThreadConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(UNetError::Config("epochs must be greater than 0".into()));
        }
        if self.batch_size == 0 {
            return Err(UNetError::Config("batch_size must be greater than 0".into()));
        }
        if self.eval_every == 0 {
            return Err(UNetError::Config("eval_every must be greater than 0".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(UNetError::Config("learning_rate must be positive".into()));
        }
        if self.model_name.trim().is_empty() {
            return Err(UNetError::Config("model_name must not be empty".into()));
        }
        if self.predictions_file.trim().is_empty() {
            return Err(UNetError::Config("predictions_file must not be empty".into()));
        }
        if self.max_samples == Some(0) {
            return Err(UNetError::Config("max_samples must be greater than 0".into()));
        }
        self.unet_config().validate()
    }

    pub fn segmentation_mode(&self) -> SegmentationMode {
        SegmentationMode::from_code(self.mode)
    }

    pub fn epoch_order(&self) -> EpochOrder {
        if self.shuffle {
            EpochOrder::Shuffled { seed: self.seed }
        } else {
            EpochOrder::Sequential
        }
    }

    /// Network configuration implied by this run
    pub fn unet_config(&self) -> UNetConfig {
        UNetConfig::new(self.input_channels, self.output_channels)
            .with_filters(self.filters.clone())
            .with_dropout_rate(self.dropout_rate)
            .with_upsample(self.upsample)
            .with_activation(self.activation)
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.output_dir.join(&self.predictions_file)
    }

    pub fn model_json_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.json", self.model_name))
    }

    /// Per-epoch losses and evaluations written when training finishes
    pub fn history_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_history.json", self.model_name))
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(UNetError::PathNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// One entry of the exported network description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub kind: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: Option<[usize; 2]>,
    pub inputs: Vec<String>,
}

impl LayerSpec {
    fn new(
        name: impl Into<String>,
        kind: &str,
        channels: [usize; 2],
        kernel: Option<[usize; 2]>,
        inputs: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.to_string(),
            in_channels: channels[0],
            out_channels: channels[1],
            kernel,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// JSON description of the constructed network, written once per run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub filters: Vec<usize>,
    pub dropout_rate: f64,
    pub upsample: UpsampleMode,
    pub activation: OutputActivation,
    /// Input height/width must be a multiple of this
    pub spatial_divisor: usize,
    pub num_params: usize,
    pub layers: Vec<LayerSpec>,
}

impl ModelDescription {
    /// Describe the graph `config` builds
    pub fn from_config(name: &str, config: &UNetConfig, num_params: usize) -> Self {
        let levels = config.filters.len();
        let mut layers = Vec::new();
        let mut prev_name = "input".to_string();
        let mut prev_channels = config.in_channels;

        for (i, &f) in config.filters.iter().enumerate() {
            let level = i + 1;
            let a = format!("conv{}a", level);
            let b = format!("conv{}b", level);
            layers.push(LayerSpec::new(
                &a,
                "conv2d_relu",
                [prev_channels, f],
                Some([3, 3]),
                &[prev_name.as_str()],
            ));
            layers.push(LayerSpec::new(&b, "conv2d_relu", [f, f], Some([3, 3]), &[a.as_str()]));
            prev_name = b;
            prev_channels = f;
            if level < levels {
                let pool = format!("pool{}", level);
                layers.push(LayerSpec::new(
                    &pool,
                    "max_pool2d",
                    [f, f],
                    Some([2, 2]),
                    &[prev_name.as_str()],
                ));
                prev_name = pool;
            }
        }
        // The bottleneck output feeds the decoder, not the last pool
        prev_name = format!("conv{}b", levels);

        let stages = levels.saturating_sub(1);
        for stage in 0..stages {
            let level = levels + 1 + stage;
            let f = config.filters[levels - 2 - stage];
            let skip = format!("conv{}b", levels - 1 - stage);

            let (up_name, up_channels) = match config.upsample {
                UpsampleMode::TransposedConv => {
                    let name = format!("transConv{}", level);
                    layers.push(LayerSpec::new(
                        &name,
                        "conv_transpose2d",
                        [prev_channels, f],
                        Some([2, 2]),
                        &[prev_name.as_str()],
                    ));
                    (name, f)
                }
                UpsampleMode::Nearest => {
                    let name = format!("up{}", level);
                    layers.push(LayerSpec::new(
                        &name,
                        "upsample_nearest",
                        [prev_channels, prev_channels],
                        None,
                        &[prev_name.as_str()],
                    ));
                    (name, prev_channels)
                }
            };
            let concat = format!("concat{}", level);
            layers.push(LayerSpec::new(
                &concat,
                "concatenate",
                [up_channels + f, up_channels + f],
                None,
                &[up_name.as_str(), skip.as_str()],
            ));

            let a = format!("conv{}a", level);
            let b = format!("conv{}b", level);
            layers.push(LayerSpec::new(
                &a,
                "conv2d_relu",
                [up_channels + f, f],
                Some([3, 3]),
                &[concat.as_str()],
            ));
            let mut b_input = a.clone();
            if config.stage_has_dropout(stage) {
                let dropout = format!("dropout{}", level);
                layers.push(LayerSpec::new(&dropout, "dropout", [f, f], None, &[a.as_str()]));
                b_input = dropout;
            }
            layers.push(LayerSpec::new(
                &b,
                "conv2d_relu",
                [f, f],
                Some([3, 3]),
                &[b_input.as_str()],
            ));
            prev_name = b;
            prev_channels = f;
        }

        let head_kind = match config.activation {
            OutputActivation::Logits => "conv2d",
            OutputActivation::Sigmoid => "conv2d_sigmoid",
        };
        layers.push(LayerSpec::new(
            "prediction",
            head_kind,
            [prev_channels, config.out_channels],
            Some([1, 1]),
            &[prev_name.as_str()],
        ));

        Self {
            name: name.to_string(),
            in_channels: config.in_channels,
            out_channels: config.out_channels,
            filters: config.filters.clone(),
            dropout_rate: config.dropout_rate,
            upsample: config.upsample,
            activation: config.activation,
            spatial_divisor: config.spatial_divisor(),
            num_params,
            layers,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
