use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};
use tracing::debug;

use crate::architectures::{BuildArchitecture, Generator};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::conv::{
    ConvError, SameConv2d, SameConv2dConfig, SameConvTranspose2d, SameConvTranspose2dConfig,
};
use crate::layers::init::{linear, Initializer};
use crate::layers::norm::BatchNormConfig;
use crate::layers::prelu::{PReLU, PReLUConfig};
use crate::layers::residual::{ResidualBlock, ResidualBlockConfig, ResidualBlockError};

/// Configuration of the text-to-image generator.
#[derive(Clone, Debug)]
pub struct TextToImageConfig {
    batch_norm: BatchNormConfig,
    grid_size: usize,
    hidden_channels: usize,
    input_kernel_size: usize,
    leaky_relu_slope: f64,
    n_residual_blocks: usize,
    noise_channels: usize,
    noise_width: usize,
    out_channels: usize,
    residual_kernel_size: usize,
    text_channels: usize,
    text_width: usize,
    upsample_layers: Vec<(usize, usize)>,
}

impl TextToImageConfig {
    /// Batch normalization used in the residual part of the generator.
    ///
    /// Default: `BatchNormConfig::default()`
    pub fn batch_norm(mut self, batch_norm: BatchNormConfig) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    /// Height and width of the grid that the inputs are projected to.
    ///
    /// Default: `8`
    pub fn grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    /// Number of channels in the residual part of the generator.
    ///
    /// Default: `64`
    pub fn hidden_channels(mut self, hidden_channels: usize) -> Self {
        self.hidden_channels = hidden_channels;
        self
    }

    /// Kernel size of the convolution over the merged inputs.
    ///
    /// Default: `9`
    pub fn input_kernel_size(mut self, input_kernel_size: usize) -> Self {
        self.input_kernel_size = input_kernel_size;
        self
    }

    /// Negative slope of the activations after upsampling.
    ///
    /// Default: `0.2`
    pub fn leaky_relu_slope(mut self, leaky_relu_slope: f64) -> Self {
        self.leaky_relu_slope = leaky_relu_slope;
        self
    }

    /// Number of residual blocks.
    ///
    /// Default: `4`
    pub fn n_residual_blocks(mut self, n_residual_blocks: usize) -> Self {
        self.n_residual_blocks = n_residual_blocks;
        self
    }

    /// Number of channels the noise is projected to.
    ///
    /// Default: `128`
    pub fn noise_channels(mut self, noise_channels: usize) -> Self {
        self.noise_channels = noise_channels;
        self
    }

    /// Width of the noise vectors.
    ///
    /// Default: `100`
    pub fn noise_width(mut self, noise_width: usize) -> Self {
        self.noise_width = noise_width;
        self
    }

    /// Number of image channels.
    ///
    /// Default: `3`
    pub fn out_channels(mut self, out_channels: usize) -> Self {
        self.out_channels = out_channels;
        self
    }

    /// Kernel size of the convolutions in residual blocks.
    ///
    /// Default: `3`
    pub fn residual_kernel_size(mut self, residual_kernel_size: usize) -> Self {
        self.residual_kernel_size = residual_kernel_size;
        self
    }

    /// Number of channels the text embedding is projected to.
    ///
    /// Default: `128`
    pub fn text_channels(mut self, text_channels: usize) -> Self {
        self.text_channels = text_channels;
        self
    }

    /// Width of the text embeddings.
    ///
    /// Default: `300`
    pub fn text_width(mut self, text_width: usize) -> Self {
        self.text_width = text_width;
        self
    }

    /// Upsampling layers as `(channels, stride)` pairs.
    ///
    /// Default: `[(512, 2), (256, 2), (128, 2), (64, 1)]`
    pub fn upsample_layers(mut self, upsample_layers: Vec<(usize, usize)>) -> Self {
        self.upsample_layers = upsample_layers;
        self
    }

    /// Height and width of generated images.
    pub fn image_size(&self) -> usize {
        self.upsample_layers
            .iter()
            .fold(self.grid_size, |size, &(_, stride)| size * stride)
    }

    /// Build the generator.
    pub fn build_generator(&self, vb: VarBuilder) -> Result<TextToImage, TextToImageError> {
        let grid_cells = self.grid_size * self.grid_size;

        let text_projection = linear(
            self.text_width,
            self.text_channels * grid_cells,
            true,
            Initializer::GlorotUniform,
            vb.push_prefix("text_projection"),
        )
        .context(BuildProjectionSnafu)?;
        let noise_projection = linear(
            self.noise_width,
            self.noise_channels * grid_cells,
            true,
            Initializer::GlorotUniform,
            vb.push_prefix("noise_projection"),
        )
        .context(BuildProjectionSnafu)?;

        let input_conv = SameConv2dConfig::default()
            .in_channels(self.noise_channels + self.text_channels)
            .out_channels(self.hidden_channels)
            .kernel_size(self.input_kernel_size)
            .build_conv(vb.push_prefix("input_conv"))
            .context(BuildConvSnafu)?;
        let input_activation = PReLUConfig::default()
            .n_channels(self.hidden_channels)
            .build_prelu(vb.push_prefix("input_activation"))
            .context(BuildPReLUSnafu)?;

        let residual_config = ResidualBlockConfig::default()
            .batch_norm(self.batch_norm.clone())
            .kernel_size(self.residual_kernel_size)
            .n_channels(self.hidden_channels);
        let residual_blocks = (0..self.n_residual_blocks)
            .map(|n| {
                residual_config
                    .build_block(vb.push_prefix(format!("residual_{n}")))
                    .context(BuildResidualBlockSnafu)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let merge_conv = SameConv2dConfig::default()
            .in_channels(self.hidden_channels)
            .out_channels(self.hidden_channels)
            .kernel_size(self.residual_kernel_size)
            .build_conv(vb.push_prefix("merge_conv"))
            .context(BuildConvSnafu)?;
        let merge_norm = self
            .batch_norm
            .clone()
            .size(self.hidden_channels)
            .build(vb.push_prefix("merge_norm"))
            .context(BuildBatchNormSnafu)?;

        let mut in_channels = self.hidden_channels;
        let mut upsample = Vec::with_capacity(self.upsample_layers.len());
        for (n, &(out_channels, stride)) in self.upsample_layers.iter().enumerate() {
            upsample.push(
                SameConvTranspose2dConfig::default()
                    .activation(Activation::LeakyRelu {
                        negative_slope: self.leaky_relu_slope,
                    })
                    .in_channels(in_channels)
                    .out_channels(out_channels)
                    .stride(stride)
                    .build_conv_transpose(vb.push_prefix(format!("upsample_{n}")))
                    .context(BuildConvSnafu)?,
            );
            in_channels = out_channels;
        }

        let output_conv = SameConv2dConfig::default()
            .activation(Activation::Tanh)
            .in_channels(in_channels)
            .out_channels(self.out_channels)
            .build_conv(vb.push_prefix("output_conv"))
            .context(BuildConvSnafu)?;

        debug!(
            n_residual_blocks = self.n_residual_blocks,
            image_size = self.image_size(),
            "Built text-to-image generator"
        );

        Ok(TextToImage {
            grid_size: self.grid_size,
            input_activation,
            input_conv,
            merge_conv,
            merge_norm,
            noise_channels: self.noise_channels,
            noise_projection,
            noise_width: self.noise_width,
            output_conv,
            residual_blocks,
            text_channels: self.text_channels,
            text_projection,
            text_width: self.text_width,
            upsample,
        })
    }
}

impl Default for TextToImageConfig {
    fn default() -> Self {
        Self {
            batch_norm: BatchNormConfig::default(),
            grid_size: 8,
            hidden_channels: 64,
            input_kernel_size: 9,
            leaky_relu_slope: 0.2,
            n_residual_blocks: 4,
            noise_channels: 128,
            noise_width: 100,
            out_channels: 3,
            residual_kernel_size: 3,
            text_channels: 128,
            text_width: 300,
            upsample_layers: vec![(512, 2), (256, 2), (128, 2), (64, 1)],
        }
    }
}

impl BuildArchitecture for TextToImageConfig {
    type Architecture = TextToImage;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        Ok(self.build_generator(vb)?)
    }
}

/// Text-to-image generator errors.
#[derive(Debug, Snafu)]
pub enum TextToImageError {
    #[snafu(display("Noise batch size ({noise}) differs from text batch size ({text})"))]
    BatchSizeMismatch { noise: usize, text: usize },

    #[snafu(display("Cannot build batch normalization"))]
    BuildBatchNorm { source: BoxedError },

    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: ConvError },

    #[snafu(display("Cannot build parametric ReLU"))]
    BuildPReLU { source: BoxedError },

    #[snafu(display("Cannot build input projection"))]
    BuildProjection { source: candle_core::Error },

    #[snafu(display("Cannot build residual block"))]
    BuildResidualBlock { source: ResidualBlockError },

    #[snafu(display("Cannot apply convolution"))]
    Conv { source: candle_core::Error },

    #[snafu(display("Cannot get shape of {input} input"))]
    InputShape {
        input: &'static str,
        source: candle_core::Error,
    },

    #[snafu(display("Width of {input} input must be {expected}, was {got}"))]
    InputWidth {
        input: &'static str,
        expected: usize,
        got: usize,
    },

    #[snafu(display("Cannot project inputs to a grid"))]
    Projection { source: candle_core::Error },

    #[snafu(display("Cannot apply residual blocks"))]
    Residual { source: candle_core::Error },

    #[snafu(display("Cannot upsample"))]
    Upsample { source: candle_core::Error },
}

/// Text-to-image generator.
///
/// Noise and a text embedding are both projected to a small grid and
/// concatenated along the channel axis. A stack of residual blocks with a
/// long skip connection transforms the grid, transposed convolutions
/// upsample it, and a final convolution maps it to image channels with
/// values in `[-1, 1]`.
///
/// Based on the SRGAN generator, see
/// [Ledig et al., 2017](https://arxiv.org/abs/1609.04802).
pub struct TextToImage {
    grid_size: usize,
    input_activation: PReLU,
    input_conv: SameConv2d,
    merge_conv: SameConv2d,
    merge_norm: Box<dyn ModuleT>,
    noise_channels: usize,
    noise_projection: Linear,
    noise_width: usize,
    output_conv: SameConv2d,
    residual_blocks: Vec<ResidualBlock>,
    text_channels: usize,
    text_projection: Linear,
    text_width: usize,
    upsample: Vec<SameConvTranspose2d>,
}

impl TextToImage {
    fn check_input(
        input: &'static str,
        xs: &Tensor,
        expected: usize,
    ) -> Result<usize, TextToImageError> {
        let (batch_size, got) = xs.dims2().context(InputShapeSnafu { input })?;
        ensure!(
            got == expected,
            InputWidthSnafu {
                input,
                expected,
                got
            }
        );
        Ok(batch_size)
    }

    fn project(
        &self,
        projection: &Linear,
        xs: &Tensor,
        batch_size: usize,
        channels: usize,
    ) -> Result<Tensor, TextToImageError> {
        projection
            .forward(xs)
            .and_then(|xs| xs.reshape((batch_size, channels, self.grid_size, self.grid_size)))
            .context(ProjectionSnafu)
    }

    /// Render images.
    ///
    /// * `noise` - Noise vectors.
    ///   *Shape:* `(batch_size, noise_width)`
    /// * `text_embedding` - Text embeddings to condition on.
    ///   *Shape:* `(batch_size, text_width)`
    /// * `train` - Whether to train the generator. In training mode,
    ///   batch normalization uses batch statistics.
    ///
    /// Returns: *Shape:* `(batch_size, out_channels, image_size, image_size)`
    pub fn render(
        &self,
        noise: &Tensor,
        text_embedding: &Tensor,
        train: bool,
    ) -> Result<Tensor, TextToImageError> {
        let noise_batch = Self::check_input("noise", noise, self.noise_width)?;
        let text_batch = Self::check_input("text", text_embedding, self.text_width)?;
        ensure!(
            noise_batch == text_batch,
            BatchSizeMismatchSnafu {
                noise: noise_batch,
                text: text_batch
            }
        );

        let noise = self.project(
            &self.noise_projection,
            noise,
            noise_batch,
            self.noise_channels,
        )?;
        let text = self.project(
            &self.text_projection,
            text_embedding,
            text_batch,
            self.text_channels,
        )?;

        let skip = Tensor::cat(&[&noise, &text], 1)
            .and_then(|merged| self.input_conv.forward(&merged))
            .and_then(|hidden| self.input_activation.forward(&hidden))
            .context(ConvSnafu)?;

        let mut hidden = skip.clone();
        for block in &self.residual_blocks {
            hidden = block.forward_t(&hidden, train).context(ResidualSnafu)?;
        }
        let mut hidden = self
            .merge_conv
            .forward(&hidden)
            .and_then(|hidden| self.merge_norm.forward_t(&hidden, train))
            .and_then(|hidden| hidden + skip)
            .context(ResidualSnafu)?;

        for layer in &self.upsample {
            hidden = layer.forward(&hidden).context(UpsampleSnafu)?;
        }

        self.output_conv.forward(&hidden).context(ConvSnafu)
    }
}

impl Generator for TextToImage {
    fn forward_t(
        &self,
        noise: &Tensor,
        text_embedding: &Tensor,
        train: bool,
    ) -> Result<Tensor, BoxedError> {
        Ok(self.render(noise, text_embedding, train)?)
    }

    fn noise_width(&self) -> usize {
        self.noise_width
    }

    fn text_width(&self) -> usize {
        self.text_width
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::{TextToImageConfig, TextToImageError};
    use crate::architectures::{BuildArchitecture, Generator};
    use crate::util::device::tests::test_devices;

    #[test]
    #[report]
    fn generator_renders_images_in_range() -> Result<(), Whatever> {
        for device in test_devices() {
            let var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let generator = TextToImageConfig::default()
                .build(vb)
                .map_err(|e| Whatever::with_source(e, "Cannot build generator".to_string()))?;

            let noise = Tensor::randn(0f32, 1., (2, 100), &device)
                .whatever_context("Cannot create noise")?;
            let text = Tensor::randn(0f32, 1., (2, 300), &device)
                .whatever_context("Cannot create text embedding")?;

            for train in [false, true] {
                let images = generator
                    .forward_t(&noise, &text, train)
                    .map_err(|e| Whatever::with_source(e, "Cannot render images".to_string()))?;
                assert_eq!(images.dims(), &[2, 3, 64, 64]);

                let values = images
                    .flatten_all()
                    .and_then(|xs| xs.to_vec1::<f32>())
                    .whatever_context("Cannot read images")?;
                assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
            }
        }
        Ok(())
    }

    #[test]
    #[report]
    fn generator_image_size_follows_strides() -> Result<(), Whatever> {
        let config = TextToImageConfig::default()
            .grid_size(4)
            .hidden_channels(8)
            .n_residual_blocks(1)
            .noise_channels(4)
            .noise_width(10)
            .text_channels(4)
            .text_width(6)
            .upsample_layers(vec![(8, 2), (4, 3)]);
        assert_eq!(config.image_size(), 24);

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let generator = config
            .build_generator(vb)
            .whatever_context("Cannot build generator")?;
        let noise = Tensor::randn(0f32, 1., (3, 10), &Device::Cpu)
            .whatever_context("Cannot create noise")?;
        let text = Tensor::randn(0f32, 1., (3, 6), &Device::Cpu)
            .whatever_context("Cannot create text embedding")?;
        let images = generator
            .render(&noise, &text, false)
            .whatever_context("Cannot render images")?;
        assert_eq!(images.dims(), &[3, 3, 24, 24]);

        Ok(())
    }

    #[test]
    fn generator_rejects_incorrect_input_widths() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let generator = TextToImageConfig::default()
            .n_residual_blocks(1)
            .build_generator(vb)
            .unwrap();

        let noise = Tensor::zeros((2, 99), DType::F32, &Device::Cpu).unwrap();
        let text = Tensor::zeros((2, 300), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            generator.render(&noise, &text, false),
            Err(TextToImageError::InputWidth {
                input: "noise",
                expected: 100,
                got: 99
            })
        ));

        let noise = Tensor::zeros((3, 100), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            generator.render(&noise, &text, false),
            Err(TextToImageError::BatchSizeMismatch { noise: 3, text: 2 })
        ));
    }
}
