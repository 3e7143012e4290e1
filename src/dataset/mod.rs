//! Dataset module: array files, modality remapping and batching
//!
//! - `npy`: memory-mapped `.npy` reader and a `float32` writer
//! - `volume`: NHWC host arrays
//! - `remap`: modality / tumor sub-region selection per mode
//! - `batcher`: batch plans, epoch order, Burn Dataset and Batcher
//! - `loader`: train/test split loading

pub mod batcher;
pub mod loader;
pub mod npy;
pub mod remap;
pub mod volume;

pub use batcher::{
    images_to_tensor, tensor_to_nhwc, BatchPlan, EpochOrder, SegmentationBatch,
    SegmentationBatcher, SegmentationDataset, SegmentationItem,
};
pub use loader::{
    load_split, prepare_split, PrepareOptions, SegmentationSplit, TEST_SUFFIX, TRAIN_SUFFIX,
};
pub use remap::{update_channels, SegmentationMode};
pub use volume::{check_pair, Volume};
