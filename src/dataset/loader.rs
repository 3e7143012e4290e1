//! Train/test split loading
//!
//! A split is a pair of preprocessed arrays in the data directory:
//! `imgs{suffix}.npy` and `msks{suffix}.npy`, with suffix `_train` or `_test`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::backend::BackendRuntime;
use crate::dataset::batcher::SegmentationDataset;
use crate::dataset::npy::read_volume;
use crate::dataset::remap::{update_channels, SegmentationMode};
use crate::dataset::volume::{check_pair, Volume};
use crate::utils::error::{Result, UNetError};
use crate::utils::format_shape;

pub const TRAIN_SUFFIX: &str = "_train";
pub const TEST_SUFFIX: &str = "_test";

/// Raw image and mask volumes of one split
#[derive(Debug, Clone)]
pub struct SegmentationSplit {
    pub name: String,
    pub images: Volume,
    pub masks: Volume,
}

impl SegmentationSplit {
    pub fn len(&self) -> usize {
        self.images.samples()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep at most `limit` leading samples
    pub fn truncate(self, limit: usize) -> Result<Self> {
        if limit >= self.len() {
            return Ok(self);
        }
        Ok(Self {
            name: self.name,
            images: self.images.range(0..limit)?,
            masks: self.masks.range(0..limit)?,
        })
    }
}

/// Paths of the image and mask arrays for `suffix`
pub fn split_paths(data_dir: &Path, suffix: &str) -> (PathBuf, PathBuf) {
    (
        data_dir.join(format!("imgs{}.npy", suffix)),
        data_dir.join(format!("msks{}.npy", suffix)),
    )
}

/// Memory-map and decode one split
pub fn load_split(data_dir: &Path, suffix: &str) -> Result<SegmentationSplit> {
    let start = Instant::now();
    let (image_path, mask_path) = split_paths(data_dir, suffix);

    let images = read_volume(&image_path)?;
    let masks = read_volume(&mask_path)?;
    check_pair(&images, &masks)?;

    tracing::info!(
        "Loaded split '{}': images {} masks {} in {:.2}s",
        suffix.trim_start_matches('_'),
        format_shape(&images.shape()),
        format_shape(&masks.shape()),
        start.elapsed().as_secs_f64()
    );

    Ok(SegmentationSplit {
        name: suffix.trim_start_matches('_').to_string(),
        images,
        masks,
    })
}

/// Options for turning a raw split into network-ready data
#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions {
    pub input_no: usize,
    pub output_no: usize,
    pub mode: SegmentationMode,
    pub max_samples: Option<usize>,
}

/// Load a split and remap it for the configured mode
///
/// Remapping runs on the runtime's inter-op pool.
pub fn prepare_split(
    data_dir: &Path,
    suffix: &str,
    options: PrepareOptions,
    runtime: &BackendRuntime,
) -> Result<SegmentationDataset> {
    let mut split = load_split(data_dir, suffix)?;
    if split.is_empty() {
        return Err(UNetError::InvalidInput(format!(
            "split '{}' in {} has no samples",
            split.name,
            data_dir.display()
        )));
    }
    if let Some(limit) = options.max_samples {
        split = split.truncate(limit)?;
    }

    let start = Instant::now();
    let (images, masks) = runtime.install(|| {
        update_channels(
            &split.images,
            &split.masks,
            options.input_no,
            options.output_no,
            options.mode,
        )
    })?;
    tracing::info!(
        "Remapped '{}' for {}: images {} masks {} in {:.2}s",
        split.name,
        options.mode,
        format_shape(&images.shape()),
        format_shape(&masks.shape()),
        start.elapsed().as_secs_f64()
    );

    SegmentationDataset::new(images, masks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{init_backend, ThreadConfig};
    use crate::dataset::npy::write_volume;
    use burn::data::dataset::Dataset;

    fn write_split(dir: &Path, suffix: &str, n: usize) {
        let (img_path, msk_path) = split_paths(dir, suffix);
        let images = Volume::new([n, 4, 4, 3], vec![0.5; n * 4 * 4 * 3]).unwrap();
        let mut masks = Volume::zeros([n, 4, 4, 4]);
        masks.data_mut()[0] = 1.0;
        write_volume(&img_path, &images).unwrap();
        write_volume(&msk_path, &masks).unwrap();
    }

    #[test]
    fn test_split_paths() {
        let (img, msk) = split_paths(Path::new("/data"), TRAIN_SUFFIX);
        assert_eq!(img, PathBuf::from("/data/imgs_train.npy"));
        assert_eq!(msk, PathBuf::from("/data/msks_train.npy"));
    }

    #[test]
    fn test_prepare_split_remaps_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), TEST_SUFFIX, 5);
        let runtime = init_backend(&ThreadConfig::default()).unwrap();

        let options = PrepareOptions {
            input_no: 1,
            output_no: 1,
            mode: SegmentationMode::WholeTumor,
            max_samples: Some(3),
        };
        let dataset = prepare_split(dir.path(), TEST_SUFFIX, options, &runtime).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.images().shape(), [3, 4, 4, 1]);
        assert_eq!(dataset.masks().get(0, 0, 0, 0), 1.0);
    }

    #[test]
    fn test_empty_split_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), TRAIN_SUFFIX, 0);
        let runtime = init_backend(&ThreadConfig::default()).unwrap();

        let options = PrepareOptions {
            input_no: 1,
            output_no: 1,
            mode: SegmentationMode::WholeTumor,
            max_samples: None,
        };
        let err = prepare_split(dir.path(), TRAIN_SUFFIX, options, &runtime).unwrap_err();
        assert!(matches!(err, UNetError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_split_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_split(dir.path(), TRAIN_SUFFIX).unwrap_err();
        assert!(matches!(err, UNetError::PathNotFound(_)));
    }
}
