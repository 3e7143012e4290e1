//! U-Net Architecture for Brain Tumor Segmentation
//!
//! Encoder-decoder network with skip connections. Each encoder level runs two
//! same-padded 3x3 ReLU convolutions and halves the resolution with a 2x2 max
//! pool (except the bottleneck). Each decoder stage doubles the resolution,
//! concatenates the mirrored encoder features along the channel axis and runs
//! two more convolutions. A 1x1 convolution produces the per-pixel output.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        interpolate::{Interpolate2d, Interpolate2dConfig, InterpolateMode},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Initializer, PaddingConfig2d, Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};

use crate::model::config::{OutputActivation, UpsampleMode};
use crate::utils::error::{Result as UNetResult, UNetError};

/// Configuration for the U-Net model
#[derive(Config, Debug)]
pub struct UNetConfig {
    /// Number of input image channels
    pub in_channels: usize,

    /// Number of predicted mask channels
    pub out_channels: usize,

    /// Filters per encoder level; the decoder mirrors all but the last
    #[config(default = "vec![32, 64, 128, 256, 512]")]
    pub filters: Vec<usize>,

    /// Dropout rate in the two shallowest decoder stages
    #[config(default = "0.2")]
    pub dropout_rate: f64,

    #[config(default = "UpsampleMode::TransposedConv")]
    pub upsample: UpsampleMode,

    #[config(default = "OutputActivation::Logits")]
    pub activation: OutputActivation,
}

impl UNetConfig {
    pub fn validate(&self) -> UNetResult<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(UNetError::Config(
                "in_channels and out_channels must be greater than 0".into(),
            ));
        }
        if self.filters.len() < 2 {
            return Err(UNetError::Config(
                "filters must list at least two encoder levels".into(),
            ));
        }
        if self.filters.contains(&0) {
            return Err(UNetError::Config("filter counts must be greater than 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(UNetError::Config("dropout_rate must be in range [0.0, 1.0)".into()));
        }
        Ok(())
    }

    /// Input height and width must be multiples of this
    pub fn spatial_divisor(&self) -> usize {
        1 << self.filters.len().saturating_sub(1)
    }

    pub fn decoder_stages(&self) -> usize {
        self.filters.len().saturating_sub(1)
    }

    /// Dropout sits in the two decoder stages closest to the output
    pub fn stage_has_dropout(&self, stage: usize) -> bool {
        self.dropout_rate > 0.0 && stage + 2 >= self.decoder_stages()
    }
}

fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_padding(PaddingConfig2d::Same)
        .with_initializer(Initializer::XavierUniform { gain: 1.0 })
        .init(device)
}

/// Two same-padded 3x3 convolutions, each followed by ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv_a: Conv2d<B>,
    pub conv_b: Conv2d<B>,
    pub relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv_a: conv3x3([in_channels, out_channels], device),
            conv_b: conv3x3([out_channels, out_channels], device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.conv_a.forward(x));
        self.relu.forward(self.conv_b.forward(x))
    }
}

/// Upsample, concatenate with the skip, then conv / dropout / conv
#[derive(Module, Debug)]
pub struct DecoderStage<B: Backend> {
    pub up_conv: Option<ConvTranspose2d<B>>,
    pub up_sample: Option<Interpolate2d>,
    pub conv_a: Conv2d<B>,
    pub dropout: Option<Dropout>,
    pub conv_b: Conv2d<B>,
    pub relu: Relu,
    stage: usize,
}

impl<B: Backend> DecoderStage<B> {
    /// `in_channels` comes from the deeper stage, `filters` matches the skip
    pub fn new(
        stage: usize,
        in_channels: usize,
        filters: usize,
        upsample: UpsampleMode,
        dropout_rate: Option<f64>,
        device: &B::Device,
    ) -> Self {
        let (up_conv, up_sample, up_channels) = match upsample {
            UpsampleMode::TransposedConv => (
                Some(
                    ConvTranspose2dConfig::new([in_channels, filters], [2, 2])
                        .with_stride([2, 2])
                        .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                        .init(device),
                ),
                None,
                filters,
            ),
            UpsampleMode::Nearest => (
                None,
                Some(
                    Interpolate2dConfig::new()
                        .with_scale_factor(Some([2.0, 2.0]))
                        .with_mode(InterpolateMode::Nearest)
                        .init(),
                ),
                in_channels,
            ),
        };

        Self {
            up_conv,
            up_sample,
            conv_a: conv3x3([up_channels + filters, filters], device),
            dropout: dropout_rate.map(|p| DropoutConfig::new(p).init()),
            conv_b: conv3x3([filters, filters], device),
            relu: Relu::new(),
            stage,
        }
    }

    fn upsample(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match (&self.up_conv, &self.up_sample) {
            (Some(conv), _) => conv.forward(x),
            (None, Some(interp)) => interp.forward(x),
            (None, None) => x,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> UNetResult<Tensor<B, 4>> {
        let up = self.upsample(x);
        let x = concat_skip(up, skip, self.stage)?;

        let x = self.relu.forward(self.conv_a.forward(x));
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };
        Ok(self.relu.forward(self.conv_b.forward(x)))
    }
}

/// Channel-axis concatenation that refuses misaligned feature maps
fn concat_skip<B: Backend>(
    up: Tensor<B, 4>,
    skip: Tensor<B, 4>,
    stage: usize,
) -> UNetResult<Tensor<B, 4>> {
    let [b, _, h, w] = up.dims();
    let [sb, _, sh, sw] = skip.dims();
    if [b, h, w] != [sb, sh, sw] {
        return Err(UNetError::shape_mismatch(
            format!("skip connection of decoder stage {}", stage + 1),
            &[sb, sh, sw],
            &[b, h, w],
        ));
    }
    Ok(Tensor::cat(vec![up, skip], 1))
}

/// Network output
#[derive(Debug, Clone)]
pub struct SegmentationOutput<B: Backend> {
    /// Pre-sigmoid scores, present unless the sigmoid is fused
    pub logits: Option<Tensor<B, 4>>,
    /// Per-pixel probabilities in [0, 1]
    pub probabilities: Tensor<B, 4>,
}

/// U-Net segmentation model
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    pub encoder: Vec<ConvBlock<B>>,
    pub pool: MaxPool2d,
    pub decoder: Vec<DecoderStage<B>>,
    pub head: Conv2d<B>,
    in_channels: usize,
    out_channels: usize,
    spatial_divisor: usize,
    fused_sigmoid: bool,
}

impl<B: Backend> UNet<B> {
    /// Create a new U-Net from configuration
    pub fn new(config: &UNetConfig, device: &B::Device) -> Self {
        let mut encoder = Vec::with_capacity(config.filters.len());
        let mut channels = config.in_channels;
        for &f in &config.filters {
            encoder.push(ConvBlock::new(channels, f, device));
            channels = f;
        }

        let levels = config.filters.len();
        let mut decoder = Vec::with_capacity(config.decoder_stages());
        for stage in 0..config.decoder_stages() {
            let filters = config.filters[levels - 2 - stage];
            let dropout = config
                .stage_has_dropout(stage)
                .then_some(config.dropout_rate);
            decoder.push(DecoderStage::new(
                stage,
                channels,
                filters,
                config.upsample,
                dropout,
                device,
            ));
            channels = filters;
        }

        let head = Conv2dConfig::new([channels, config.out_channels], [1, 1])
            .with_initializer(Initializer::XavierUniform { gain: 1.0 })
            .init(device);

        Self {
            encoder,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            decoder,
            head,
            in_channels: config.in_channels,
            out_channels: config.out_channels,
            spatial_divisor: config.spatial_divisor(),
            fused_sigmoid: config.activation == OutputActivation::Sigmoid,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, in_channels, height, width]
    ///
    /// # Returns
    /// * Output maps of shape [batch_size, out_channels, height, width], or
    ///   `ShapeMismatch` when height/width are not multiples of the spatial
    ///   divisor
    pub fn forward(&self, x: Tensor<B, 4>) -> UNetResult<SegmentationOutput<B>> {
        let [_, channels, height, width] = x.dims();
        if channels != self.in_channels {
            return Err(UNetError::shape_mismatch(
                "network input channels",
                &[self.in_channels],
                &[channels],
            ));
        }
        let divisor = self.spatial_divisor;
        if height == 0 || width == 0 || height % divisor != 0 || width % divisor != 0 {
            let fit = |d: usize| d.next_multiple_of(divisor).max(divisor);
            return Err(UNetError::shape_mismatch(
                format!("input height/width (non-zero multiples of {})", divisor),
                &[fit(height), fit(width)],
                &[height, width],
            ));
        }

        let last = self.encoder.len().saturating_sub(1);
        let mut skips = Vec::with_capacity(last);
        let mut x = x;
        for (level, block) in self.encoder.iter().enumerate() {
            x = block.forward(x);
            if level < last {
                skips.push(x.clone());
                x = self.pool.forward(x);
            }
        }

        for stage in &self.decoder {
            let skip = skips.pop().ok_or_else(|| {
                UNetError::Training("decoder stage without a matching skip connection".into())
            })?;
            x = stage.forward(x, skip)?;
        }

        let out = self.head.forward(x);
        Ok(if self.fused_sigmoid {
            SegmentationOutput {
                logits: None,
                probabilities: sigmoid(out),
            }
        } else {
            SegmentationOutput {
                probabilities: sigmoid(out.clone()),
                logits: Some(out),
            }
        })
    }

    /// Forward pass returning probabilities only, for inference
    pub fn forward_probabilities(&self, x: Tensor<B, 4>) -> UNetResult<Tensor<B, 4>> {
        Ok(self.forward(x)?.probabilities)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> UNetConfig {
        UNetConfig::new(1, 1).with_filters(vec![2, 4, 4, 8, 8])
    }

    #[test]
    fn test_output_matches_input_spatial_dims() {
        let device = Default::default();
        for upsample in [UpsampleMode::TransposedConv, UpsampleMode::Nearest] {
            let config = small_config().with_upsample(upsample);
            let model = UNet::<TestBackend>::new(&config, &device);
            for size in [64, 128, 256] {
                let input = Tensor::<TestBackend, 4>::zeros([1, 1, size, size], &device);
                let output = model.forward(input).unwrap();
                assert_eq!(output.probabilities.dims(), [1, 1, size, size]);
                assert_eq!(output.logits.unwrap().dims(), [1, 1, size, size]);
            }
        }
    }

    #[test]
    fn test_output_channels_follow_config() {
        let device = Default::default();
        let config = UNetConfig::new(3, 2).with_filters(vec![2, 4, 8]);
        let model = UNet::<TestBackend>::new(&config, &device);
        let input = Tensor::<TestBackend, 4>::ones([2, 3, 16, 16], &device);
        let output = model.forward(input).unwrap();
        assert_eq!(output.probabilities.dims(), [2, 2, 16, 16]);
    }

    #[test]
    fn test_indivisible_input_is_a_shape_mismatch() {
        let device = Default::default();
        let model = UNet::<TestBackend>::new(&small_config(), &device);
        let input = Tensor::<TestBackend, 4>::zeros([1, 1, 24, 24], &device);
        let err = model.forward(input).unwrap_err();
        assert!(matches!(err, UNetError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_input_smaller_than_divisor_is_a_shape_mismatch() {
        let device = Default::default();
        let model = UNet::<TestBackend>::new(&small_config(), &device);
        for size in [8, 1] {
            let input = Tensor::<TestBackend, 4>::zeros([1, 1, size, size], &device);
            let err = model.forward(input).unwrap_err();
            assert!(matches!(err, UNetError::ShapeMismatch { .. }), "size {}", size);
        }

        let input = Tensor::<TestBackend, 4>::zeros([1, 1, 16, 8], &device);
        assert!(model.forward(input).is_err());
    }

    #[test]
    fn test_wrong_input_channels() {
        let device = Default::default();
        let model = UNet::<TestBackend>::new(&small_config(), &device);
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        assert!(matches!(
            model.forward(input),
            Err(UNetError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_fused_sigmoid_has_no_logits_and_bounded_output() {
        let device = Default::default();
        let config = small_config().with_activation(OutputActivation::Sigmoid);
        let model = UNet::<TestBackend>::new(&config, &device);
        let input = Tensor::<TestBackend, 4>::random(
            [1, 1, 16, 16],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let output = model.forward(input).unwrap();
        assert!(output.logits.is_none());
        let values = output.probabilities.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_config_helpers() {
        let config = UNetConfig::new(1, 1);
        assert_eq!(config.spatial_divisor(), 16);
        assert_eq!(config.decoder_stages(), 4);
        assert!(!config.stage_has_dropout(1));
        assert!(config.stage_has_dropout(2));
        assert!(config.stage_has_dropout(3));
        assert!(config.validate().is_ok());

        assert!(UNetConfig::new(1, 1).with_filters(vec![8]).validate().is_err());
        assert!(UNetConfig::new(0, 1).validate().is_err());
        assert!(!UNetConfig::new(1, 1).with_dropout_rate(0.0).stage_has_dropout(3));
    }

    #[test]
    fn test_decoder_layout() {
        let device = Default::default();
        let model = UNet::<TestBackend>::new(&UNetConfig::new(1, 1), &device);
        assert_eq!(model.encoder.len(), 5);
        assert_eq!(model.decoder.len(), 4);
        let with_dropout: Vec<bool> = model.decoder.iter().map(|s| s.dropout.is_some()).collect();
        assert_eq!(with_dropout, vec![false, false, true, true]);
    }
}
