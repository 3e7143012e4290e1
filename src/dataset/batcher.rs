//! Burn Dataset and Batcher implementation for image/mask volumes
//!
//! Host volumes are NHWC; the batcher emits NCHW tensors, which is what
//! burn's convolution layers expect.

use std::ops::Range;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::volume::{check_pair, Volume};
use crate::utils::error::{Result, ResultExt, UNetError};

/// Contiguous batch layout for one pass over `total` samples
///
/// Full batches come first, starting at index 0, then a single partial batch
/// holding the remainder when `total` is not a multiple of `batch_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    total: usize,
    batch_size: usize,
}

impl BatchPlan {
    pub fn new(total: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(UNetError::Config("batch_size must be greater than 0".into()));
        }
        Ok(Self { total, batch_size })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn full_batches(&self) -> usize {
        self.total / self.batch_size
    }

    /// Size of the trailing partial batch, 0 when there is none
    pub fn partial_len(&self) -> usize {
        self.total % self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.full_batches() + usize::from(self.partial_len() > 0)
    }

    /// Position ranges of every batch; never yields an empty range
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> {
        let Self { total, batch_size } = *self;
        (0..self.num_batches()).map(move |b| b * batch_size..((b + 1) * batch_size).min(total))
    }
}

/// Order in which samples are visited during an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EpochOrder {
    /// Index order, identical every epoch
    #[default]
    Sequential,
    /// A fresh permutation per epoch, reproducible from `seed`
    Shuffled { seed: u64 },
}

impl EpochOrder {
    /// Sample indices for `epoch`, a permutation of `0..total`
    pub fn indices(&self, total: usize, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..total).collect();
        if let Self::Shuffled { seed } = self {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
    }
}

/// A single image/mask pair, both flattened NHWC
#[derive(Debug, Clone)]
pub struct SegmentationItem {
    pub image: Vec<f32>,
    pub mask: Vec<f32>,
}

/// Paired image and mask volumes implementing Burn's Dataset trait
#[derive(Debug, Clone)]
pub struct SegmentationDataset {
    images: Volume,
    masks: Volume,
}

impl SegmentationDataset {
    pub fn new(images: Volume, masks: Volume) -> Result<Self> {
        check_pair(&images, &masks)?;
        Ok(Self { images, masks })
    }

    pub fn images(&self) -> &Volume {
        &self.images
    }

    pub fn masks(&self) -> &Volume {
        &self.masks
    }

    /// Items at `indices`, in order
    pub fn items(&self, indices: &[usize]) -> Result<Vec<SegmentationItem>> {
        indices
            .iter()
            .map(|&i| {
                self.get(i).with_context(|| {
                    format!("sample index {} out of range for {} samples", i, self.len())
                })
            })
            .collect()
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        if index >= self.images.samples() {
            return None;
        }
        Some(SegmentationItem {
            image: self.images.sample(index).to_vec(),
            mask: self.masks.sample(index).to_vec(),
        })
    }

    fn len(&self) -> usize {
        self.images.samples()
    }
}

/// A batch of NCHW images and masks
#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// Images [batch, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Masks [batch, classes, height, width]
    pub masks: Tensor<B, 4>,
}

/// Batcher for creating segmentation batches
#[derive(Clone, Debug)]
pub struct SegmentationBatcher<B: Backend> {
    device: B::Device,
    height: usize,
    width: usize,
    image_channels: usize,
    mask_channels: usize,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub fn new(
        device: B::Device,
        height: usize,
        width: usize,
        image_channels: usize,
        mask_channels: usize,
    ) -> Self {
        Self {
            device,
            height,
            width,
            image_channels,
            mask_channels,
        }
    }

    /// Batcher sized for the samples of `dataset`
    pub fn for_dataset(device: B::Device, dataset: &SegmentationDataset) -> Self {
        Self::new(
            device,
            dataset.images.height(),
            dataset.images.width(),
            dataset.images.channels(),
            dataset.masks.channels(),
        )
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

impl<B: Backend> Batcher<SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationItem>) -> SegmentationBatch<B> {
        let batch_size = items.len();

        let images_data: Vec<f32> =
            items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let masks_data: Vec<f32> =
            items.iter().flat_map(|item| item.mask.iter().copied()).collect();

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(
                images_data,
                [batch_size, self.height, self.width, self.image_channels],
            ),
            &self.device,
        )
        .permute([0, 3, 1, 2]);
        let masks = Tensor::<B, 4>::from_floats(
            TensorData::new(
                masks_data,
                [batch_size, self.height, self.width, self.mask_channels],
            ),
            &self.device,
        )
        .permute([0, 3, 1, 2]);

        SegmentationBatch { images, masks }
    }
}

/// Upload an NHWC volume as an NCHW tensor
pub fn images_to_tensor<B: Backend>(volume: &Volume, device: &B::Device) -> Tensor<B, 4> {
    Tensor::<B, 4>::from_floats(
        TensorData::new(volume.data().to_vec(), volume.shape()),
        device,
    )
    .permute([0, 3, 1, 2])
}

/// Download an NCHW tensor into an NHWC volume
pub fn tensor_to_nhwc<B: Backend>(tensor: Tensor<B, 4>) -> Result<Volume> {
    let nhwc = tensor.permute([0, 2, 3, 1]);
    let shape = nhwc.dims();
    let data = nhwc
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| UNetError::Training(format!("Failed to read tensor data: {:?}", e)))?;
    Volume::new(shape, data)
}
