//! Model checkpointing and restore.
//!
//! This module provides:
//! - Best-model persistence with a JSON metadata sidecar
//! - Optional per-epoch snapshots
//! - Restore with fallback to fresh initialization

use std::fs;
use std::path::{Path, PathBuf};

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::unet::{UNet, UNetConfig};
use crate::utils::error::{Result, UNetError};

/// Extension `CompactRecorder` appends to checkpoint paths
pub const RECORD_EXTENSION: &str = "mpk";

/// Metadata written next to the best checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    /// Epoch (1-based) after which the weights were saved
    pub epoch: usize,
    /// Optimizer steps taken when the weights were saved
    pub iteration: usize,
    pub test_loss: f64,
    pub dice: f64,
    pub timestamp: String,
    /// Network the weights belong to
    pub network: UNetConfig,
}

impl CheckpointMetadata {
    pub fn new(
        model_name: &str,
        epoch: usize,
        iteration: usize,
        test_loss: f64,
        dice: f64,
        network: UNetConfig,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            epoch,
            iteration,
            test_loss,
            dice,
            timestamp: chrono::Utc::now().to_rfc3339(),
            network,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// How the model for a run was obtained
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    /// Weights loaded from this checkpoint
    Restored { path: PathBuf, epoch: Option<usize> },
    /// Freshly initialized, with the reason restore was skipped or failed
    Fresh { reason: String },
}

impl RestoreOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, RestoreOutcome::Restored { .. })
    }
}

/// Checkpoint files for one model in one directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    model_name: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            model_name: model_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Best checkpoint path, without the recorder's extension
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}_best", self.model_name))
    }

    /// Per-epoch snapshot path, without the recorder's extension
    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}_{:03}", self.model_name, epoch))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!("{}_best.json", self.model_name))
    }

    /// The file the recorder actually writes for `path`
    pub fn record_file(path: &Path) -> PathBuf {
        let mut file = path.as_os_str().to_owned();
        file.push(".");
        file.push(RECORD_EXTENSION);
        PathBuf::from(file)
    }

    pub fn has_best(&self) -> bool {
        Self::record_file(&self.best_path()).exists()
    }

    fn save_model<B: Backend>(&self, model: &UNet<B>, path: &Path) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        model
            .clone()
            .save_file(path, &CompactRecorder::new())
            .map_err(|e| UNetError::Checkpoint(format!("Failed to save model: {:?}", e)))
    }

    /// Overwrite the best checkpoint and its metadata
    pub fn save_best<B: Backend>(
        &self,
        model: &UNet<B>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let path = self.best_path();
        self.save_model(model, &path)?;
        metadata.save(&self.metadata_path())?;
        Ok(path)
    }

    /// Write a snapshot keyed by epoch
    pub fn save_epoch<B: Backend>(&self, model: &UNet<B>, epoch: usize) -> Result<PathBuf> {
        let path = self.epoch_path(epoch);
        self.save_model(model, &path)?;
        info!("Epoch snapshot saved to {}", path.display());
        Ok(path)
    }

    /// Load the best checkpoint into a model built from `config`
    pub fn load_best<B: Backend>(
        &self,
        config: &UNetConfig,
        device: &B::Device,
    ) -> Result<UNet<B>> {
        let path = self.best_path();
        if !self.has_best() {
            return Err(UNetError::Checkpoint(format!(
                "no checkpoint at {}",
                Self::record_file(&path).display()
            )));
        }

        // Records are not shape-checked on load, so the sidecar must vouch for them
        let metadata_path = self.metadata_path();
        if !metadata_path.exists() {
            return Err(UNetError::Checkpoint(format!(
                "checkpoint at {} has no metadata at {}",
                path.display(),
                metadata_path.display()
            )));
        }
        let metadata = CheckpointMetadata::load(&metadata_path)
            .map_err(|e| UNetError::Checkpoint(format!("unreadable metadata: {}", e)))?;
        if serde_json::to_value(&metadata.network)? != serde_json::to_value(config)? {
            return Err(UNetError::Checkpoint(format!(
                "checkpoint at {} was trained with a different network configuration",
                path.display()
            )));
        }

        UNet::new(config, device)
            .load_file(&path, &CompactRecorder::new(), device)
            .map_err(|e| UNetError::Checkpoint(format!("Failed to load model: {:?}", e)))
    }

    /// Restore the best checkpoint, or build a fresh model
    ///
    /// A missing or incompatible checkpoint is logged and a freshly
    /// initialized model is returned instead. Only errors that are not
    /// recoverable are propagated.
    pub fn restore_or_init<B: Backend>(
        &self,
        config: &UNetConfig,
        restore: bool,
        device: &B::Device,
    ) -> Result<(UNet<B>, RestoreOutcome)> {
        if !restore {
            return Ok((
                UNet::new(config, device),
                RestoreOutcome::Fresh {
                    reason: "restore disabled".to_string(),
                },
            ));
        }

        match self.load_best(config, device) {
            Ok(model) => {
                let path = self.best_path();
                let epoch = CheckpointMetadata::load(&self.metadata_path())
                    .ok()
                    .map(|m| m.epoch);
                info!("Restored model weights from {}", path.display());
                Ok((model, RestoreOutcome::Restored { path, epoch }))
            }
            Err(e) if e.is_recoverable() => {
                warn!("No usable checkpoint ({}); starting from fresh weights", e);
                Ok((
                    UNet::new(config, device),
                    RestoreOutcome::Fresh {
                        reason: e.to_string(),
                    },
                ))
            }
            Err(e) => Err(e),
        }
    }
}
