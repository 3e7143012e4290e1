//! Host-side image and mask volumes in `[batch, height, width, channel]` order.

use std::ops::Range;

use crate::utils::error::{Result, UNetError};

/// Dense NHWC array of `f32`
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Volume {
    /// Wrap `data`, checking that it holds exactly `n*h*w*c` elements
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(UNetError::shape_mismatch(
                "volume element count",
                &[expected],
                &[data.len()],
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn samples(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }

    pub fn channels(&self) -> usize {
        self.shape[3]
    }

    /// Elements in a single sample
    pub fn sample_len(&self) -> usize {
        self.shape[1] * self.shape[2] * self.shape[3]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Flat slice of sample `i`
    pub fn sample(&self, i: usize) -> &[f32] {
        let len = self.sample_len();
        &self.data[i * len..(i + 1) * len]
    }

    pub fn get(&self, n: usize, h: usize, w: usize, c: usize) -> f32 {
        let [_, height, width, channels] = self.shape;
        self.data[((n * height + h) * width + w) * channels + c]
    }

    /// Copy a contiguous range of samples
    pub fn range(&self, range: Range<usize>) -> Result<Volume> {
        if range.start > range.end || range.end > self.samples() {
            return Err(UNetError::InvalidInput(format!(
                "sample range {:?} out of bounds for {} samples",
                range,
                self.samples()
            )));
        }
        let len = self.sample_len();
        let [_, h, w, c] = self.shape;
        Ok(Volume {
            shape: [range.len(), h, w, c],
            data: self.data[range.start * len..range.end * len].to_vec(),
        })
    }

    /// Overwrite samples starting at `offset` with the contents of `batch`
    pub fn write_samples(&mut self, offset: usize, batch: &Volume) -> Result<()> {
        let [_, h, w, c] = self.shape;
        let [bn, bh, bw, bc] = batch.shape;
        if [bh, bw, bc] != [h, w, c] {
            return Err(UNetError::shape_mismatch(
                "batch write",
                &[h, w, c],
                &[bh, bw, bc],
            ));
        }
        if offset + bn > self.samples() {
            return Err(UNetError::InvalidInput(format!(
                "writing {} samples at {} overflows {} samples",
                bn,
                offset,
                self.samples()
            )));
        }
        let len = self.sample_len();
        self.data[offset * len..(offset + bn) * len].copy_from_slice(&batch.data);
        Ok(())
    }
}

/// Images and masks must agree on batch, height and width
pub fn check_pair(images: &Volume, masks: &Volume) -> Result<()> {
    let [n, h, w, _] = images.shape();
    let [mn, mh, mw, _] = masks.shape();
    if [n, h, w] != [mn, mh, mw] {
        return Err(UNetError::shape_mismatch(
            "image/mask pair",
            &[n, h, w],
            &[mn, mh, mw],
        ));
    }
    Ok(())
}
