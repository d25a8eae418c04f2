use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::conv::{ConvError, SameConv2d, SameConv2dConfig};
use crate::layers::norm::BatchNormConfig;
use crate::layers::prelu::{PReLU, PReLUConfig};

/// Errors for residual blocks.
#[derive(Debug, Snafu)]
pub enum ResidualBlockError {
    #[snafu(display("Cannot build batch normalization"))]
    BuildBatchNorm { source: BoxedError },

    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: ConvError },

    #[snafu(display("Cannot build parametric ReLU"))]
    BuildPReLU { source: BoxedError },
}

/// Residual block configuration.
#[derive(Clone, Debug)]
pub struct ResidualBlockConfig {
    batch_norm: BatchNormConfig,
    kernel_size: usize,
    n_channels: usize,
}

impl ResidualBlockConfig {
    /// Batch normalization after each convolution.
    ///
    /// The size is set to the number of channels when the block is built.
    ///
    /// Default: `BatchNormConfig::default()`
    pub fn batch_norm(mut self, batch_norm: BatchNormConfig) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    /// Kernel size of the convolutions.
    ///
    /// Default: `3`
    pub fn kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Number of input and output channels.
    ///
    /// Default: `64`
    pub fn n_channels(mut self, n_channels: usize) -> Self {
        self.n_channels = n_channels;
        self
    }

    /// Build the residual block.
    pub fn build_block(&self, vb: VarBuilder) -> Result<ResidualBlock, ResidualBlockError> {
        let conv = SameConv2dConfig::default()
            .in_channels(self.n_channels)
            .out_channels(self.n_channels)
            .kernel_size(self.kernel_size);
        let batch_norm = self.batch_norm.clone().size(self.n_channels);

        Ok(ResidualBlock {
            conv1: conv
                .build_conv(vb.push_prefix("conv1"))
                .context(BuildConvSnafu)?,
            norm1: batch_norm
                .build(vb.push_prefix("norm1"))
                .context(BuildBatchNormSnafu)?,
            activation: PReLUConfig::default()
                .n_channels(self.n_channels)
                .build_prelu(vb.push_prefix("activation"))
                .context(BuildPReLUSnafu)?,
            conv2: conv
                .build_conv(vb.push_prefix("conv2"))
                .context(BuildConvSnafu)?,
            norm2: batch_norm
                .build(vb.push_prefix("norm2"))
                .context(BuildBatchNormSnafu)?,
        })
    }
}

impl Default for ResidualBlockConfig {
    fn default() -> Self {
        Self {
            batch_norm: BatchNormConfig::default(),
            kernel_size: 3,
            n_channels: 64,
        }
    }
}

impl BuildModule for ResidualBlockConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(self.build_block(vb)?))
    }
}

/// Convolutional residual block.
///
/// Applies `conv → batch norm → PReLU → conv → batch norm` and adds the
/// result to the block input. The number of channels and the spatial size
/// are preserved.
///
/// See [He et al., 2016](https://arxiv.org/abs/1512.03385) and
/// [Ledig et al., 2017](https://arxiv.org/abs/1609.04802).
pub struct ResidualBlock {
    activation: PReLU,
    conv1: SameConv2d,
    conv2: SameConv2d,
    norm1: Box<dyn ModuleT>,
    norm2: Box<dyn ModuleT>,
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let hidden = self.conv1.forward_t(xs, train)?;
        let hidden = self.norm1.forward_t(&hidden, train)?;
        let hidden = self.activation.forward_t(&hidden, train)?;
        let hidden = self.conv2.forward_t(&hidden, train)?;
        let hidden = self.norm2.forward_t(&hidden, train)?;
        xs + hidden
    }
}
