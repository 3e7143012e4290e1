//! Inference Predictor Module
//!
//! Batched prediction of probability maps over a whole split, using the same
//! full-plus-partial batch layout as training.

use std::path::Path;
use std::time::Instant;

use burn::tensor::backend::Backend;
use tracing::{debug_span, info};

use crate::dataset::batcher::{images_to_tensor, tensor_to_nhwc, BatchPlan};
use crate::dataset::npy::write_volume;
use crate::dataset::volume::Volume;
use crate::model::unet::UNet;
use crate::utils::error::{Result, UNetError};
use crate::utils::format_shape;

/// Runs a trained (non-autodiff) model over image volumes
pub struct Predictor<B: Backend> {
    model: UNet<B>,
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: UNet<B>, batch_size: usize, device: B::Device) -> Result<Self> {
        if batch_size == 0 {
            return Err(UNetError::Config("batch_size must be greater than 0".into()));
        }
        Ok(Self {
            model,
            batch_size,
            device,
        })
    }

    pub fn model(&self) -> &UNet<B> {
        &self.model
    }

    /// Probability maps for every sample of `images`
    ///
    /// Returns an NHWC volume with one sample per input sample and the
    /// model's output channel count.
    pub fn predict(&self, images: &Volume) -> Result<Volume> {
        let start = Instant::now();
        let [n, h, w, _] = images.shape();
        let plan = BatchPlan::new(n, self.batch_size)?;
        let mut predictions = Volume::zeros([n, h, w, self.model.out_channels()]);

        for range in plan.ranges() {
            let _span =
                debug_span!("predict_batch", start = range.start, len = range.len()).entered();
            let offset = range.start;
            let batch = images.range(range)?;
            let input = images_to_tensor::<B>(&batch, &self.device);
            let probabilities = self.model.forward_probabilities(input)?;
            predictions.write_samples(offset, &tensor_to_nhwc(probabilities)?)?;
        }

        info!(
            "Predicted {} masks {} in {:.2}s",
            n,
            format_shape(&predictions.shape()),
            start.elapsed().as_secs_f64()
        );
        Ok(predictions)
    }
}

/// Persist predictions as a `float32` `.npy` array
pub fn save_predictions(predictions: &Volume, path: &Path) -> Result<()> {
    write_volume(path, predictions)?;
    info!("Saved predictions to {}", path.display());
    Ok(())
}
