//! Modality and tumor sub-region selection
//!
//! Raw volumes carry several MRI modalities per pixel and four one-hot tumor
//! class channels. A [`SegmentationMode`] picks the modality fed to the
//! network and which class channels are summed into the binary target.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::volume::{check_pair, Volume};
use crate::utils::error::{Result, UNetError};

/// Number of class channels in a raw mask volume
pub const MASK_CLASS_CHANNELS: usize = 4;

/// Minimum modality channels in a raw image volume for modes 1-3
pub const MIN_MODALITY_CHANNELS: usize = 3;

/// Which modality and which tumor sub-region a run targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentationMode {
    /// FLAIR against all four classes
    WholeTumor,
    /// T1 post-contrast against the enhancing class
    EnhancingTumor,
    /// T2 against classes 0, 2 and 3
    ActiveCore,
    /// Leading image channels as-is against all four classes
    Default,
}

impl SegmentationMode {
    /// Map the numeric mode code; anything outside 1-3 is `Default`
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::WholeTumor,
            2 => Self::EnhancingTumor,
            3 => Self::ActiveCore,
            _ => Self::Default,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::WholeTumor => 1,
            Self::EnhancingTumor => 2,
            Self::ActiveCore => 3,
            Self::Default => 0,
        }
    }

    /// Modality channel copied to output image channel 0
    pub fn image_channel(&self) -> Option<usize> {
        match self {
            Self::WholeTumor => Some(2),
            Self::EnhancingTumor => Some(0),
            Self::ActiveCore => Some(1),
            Self::Default => None,
        }
    }

    /// Mask class channels summed into output mask channel 0
    pub fn mask_channels(&self) -> &'static [usize] {
        match self {
            Self::WholeTumor | Self::Default => &[0, 1, 2, 3],
            Self::EnhancingTumor => &[3],
            Self::ActiveCore => &[0, 2, 3],
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::WholeTumor => "Whole tumor (FLAIR)",
            Self::EnhancingTumor => "Enhancing tumor (T1 post)",
            Self::ActiveCore => "Active core (T2)",
            Self::Default => "All classes, unmodified modalities",
        }
    }
}

impl std::fmt::Display for SegmentationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mode {} - {}", self.code(), self.describe())
    }
}

/// Select modalities and build binary targets for `mode`
///
/// Returns images with `input_no` channels and masks with `output_no`
/// channels. Only channel 0 of each output is populated by the selected
/// modes; the remaining channels stay zero. Samples are processed in
/// parallel on the current rayon pool.
pub fn update_channels(
    images: &Volume,
    masks: &Volume,
    input_no: usize,
    output_no: usize,
    mode: SegmentationMode,
) -> Result<(Volume, Volume)> {
    check_pair(images, masks)?;
    if input_no == 0 || output_no == 0 {
        return Err(UNetError::InvalidInput(format!(
            "channel counts must be positive (input_no = {}, output_no = {})",
            input_no, output_no
        )));
    }
    if masks.channels() != MASK_CLASS_CHANNELS {
        return Err(UNetError::InvalidInput(format!(
            "masks must have {} class channels, found {}",
            MASK_CLASS_CHANNELS,
            masks.channels()
        )));
    }
    if mode.image_channel().is_some() && images.channels() < MIN_MODALITY_CHANNELS {
        return Err(UNetError::InvalidInput(format!(
            "{} needs at least {} image channels, found {}",
            mode,
            MIN_MODALITY_CHANNELS,
            images.channels()
        )));
    }

    let [n, h, w, c] = images.shape();
    let pixels = h * w;
    let mut new_images = Volume::zeros([n, h, w, input_no]);
    let mut new_masks = Volume::zeros([n, h, w, output_no]);
    if n == 0 || pixels == 0 {
        return Ok((new_images, new_masks));
    }

    let copy_channels = input_no.min(c);
    let summed = mode.mask_channels();

    new_images
        .data_mut()
        .par_chunks_mut(pixels * input_no)
        .zip(new_masks.data_mut().par_chunks_mut(pixels * output_no))
        .enumerate()
        .for_each(|(i, (img_out, msk_out))| {
            let img_in = images.sample(i);
            let msk_in = masks.sample(i);
            for p in 0..pixels {
                let src = &img_in[p * c..(p + 1) * c];
                let dst = &mut img_out[p * input_no..(p + 1) * input_no];
                match mode.image_channel() {
                    Some(ch) => dst[0] = src[ch],
                    None => dst[..copy_channels].copy_from_slice(&src[..copy_channels]),
                }

                let classes = &msk_in[p * MASK_CLASS_CHANNELS..(p + 1) * MASK_CLASS_CHANNELS];
                msk_out[p * output_no] = summed.iter().map(|&k| classes[k]).sum();
            }
        });

    Ok((new_images, new_masks))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One sample, 2x2 pixels; image channel k holds 10*k + pixel,
    /// mask channel k is set on pixel k only.
    fn raw_pair(image_channels: usize) -> (Volume, Volume) {
        let mut img = Vec::new();
        for p in 0..4 {
            for k in 0..image_channels {
                img.push((10 * k + p) as f32);
            }
        }
        let mut msk = Vec::new();
        for p in 0..4 {
            for k in 0..4 {
                msk.push(if k == p { 1.0 } else { 0.0 });
            }
        }
        (
            Volume::new([1, 2, 2, image_channels], img).unwrap(),
            Volume::new([1, 2, 2, 4], msk).unwrap(),
        )
    }

    #[test]
    fn test_from_code() {
        assert_eq!(SegmentationMode::from_code(1), SegmentationMode::WholeTumor);
        assert_eq!(SegmentationMode::from_code(2), SegmentationMode::EnhancingTumor);
        assert_eq!(SegmentationMode::from_code(3), SegmentationMode::ActiveCore);
        assert_eq!(SegmentationMode::from_code(7), SegmentationMode::Default);
        assert_eq!(SegmentationMode::from_code(-1), SegmentationMode::Default);
    }

    #[test]
    fn test_output_channel_counts_for_all_modes() {
        let (images, masks) = raw_pair(4);
        for code in 1..=3 {
            for (input_no, output_no) in [(1, 1), (3, 2)] {
                let mode = SegmentationMode::from_code(code);
                let (i, m) = update_channels(&images, &masks, input_no, output_no, mode).unwrap();
                assert_eq!(i.shape(), [1, 2, 2, input_no]);
                assert_eq!(m.shape(), [1, 2, 2, output_no]);
            }
        }
    }

    #[test]
    fn test_whole_tumor_selects_flair_and_sums_all() {
        let (images, masks) = raw_pair(4);
        let (i, m) =
            update_channels(&images, &masks, 1, 1, SegmentationMode::WholeTumor).unwrap();
        assert_eq!(i.data(), &[20.0, 21.0, 22.0, 23.0]);
        assert_eq!(m.data(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_enhancing_and_active_core_targets() {
        let (images, masks) = raw_pair(3);

        let (i, m) =
            update_channels(&images, &masks, 1, 1, SegmentationMode::EnhancingTumor).unwrap();
        assert_eq!(i.data(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(m.data(), &[0.0, 0.0, 0.0, 1.0]);

        let (i, m) =
            update_channels(&images, &masks, 1, 1, SegmentationMode::ActiveCore).unwrap();
        assert_eq!(i.data(), &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(m.data(), &[1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_extra_output_channels_are_zero() {
        let (images, masks) = raw_pair(3);
        let (_, m) = update_channels(&images, &masks, 1, 2, SegmentationMode::WholeTumor).unwrap();
        for p in 0..4 {
            assert_eq!(m.get(0, p / 2, p % 2, 1), 0.0);
        }
    }

    #[test]
    fn test_default_mode_keeps_leading_channels() {
        let (images, masks) = raw_pair(2);
        let (i, _) = update_channels(&images, &masks, 3, 1, SegmentationMode::Default).unwrap();
        assert_eq!(i.get(0, 0, 1, 0), 1.0);
        assert_eq!(i.get(0, 0, 1, 1), 11.0);
        assert_eq!(i.get(0, 0, 1, 2), 0.0);
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        let (images, _) = raw_pair(4);
        let three_class = Volume::zeros([1, 2, 2, 3]);
        assert!(matches!(
            update_channels(&images, &three_class, 1, 1, SegmentationMode::WholeTumor),
            Err(UNetError::InvalidInput(_))
        ));

        let (narrow, masks) = raw_pair(2);
        assert!(update_channels(&narrow, &masks, 1, 1, SegmentationMode::ActiveCore).is_err());

        let (images, masks) = raw_pair(4);
        assert!(update_channels(&images, &masks, 0, 1, SegmentationMode::WholeTumor).is_err());

        let other = Volume::zeros([2, 2, 2, 4]);
        assert!(matches!(
            update_channels(&images, &other, 1, 1, SegmentationMode::WholeTumor),
            Err(UNetError::ShapeMismatch { .. })
        ));
    }
}
