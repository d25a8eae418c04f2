//! Convolutions with `same` padding.
//!
//! Convolutions in this module pad their input such that the spatial
//! size of the output only depends on the stride: a convolution produces
//! `ceil(size / stride)` positions, a transposed convolution produces
//! `size * stride` positions.
use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{
    Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init, VarBuilder,
};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::init::Initializer;

/// Errors for convolution layers.
#[derive(Debug, Snafu)]
pub enum ConvError {
    #[snafu(display("Cannot construct convolution"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Kernel size must be odd for same padding, was {kernel_size}"))]
    EvenKernel { kernel_size: usize },

    #[snafu(display("Stride must be at least 1"))]
    ZeroStride,
}

/// Configuration for a 2D convolution with same padding.
#[derive(Clone, Debug)]
pub struct SameConv2dConfig {
    activation: Activation,
    in_channels: usize,
    initializer: Initializer,
    kernel_size: usize,
    out_channels: usize,
    stride: usize,
}

impl SameConv2dConfig {
    /// Activation applied to the convolution output.
    ///
    /// Default: `Activation::Identity`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Number of input channels.
    ///
    /// Default: `64`
    pub fn in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Kernel initializer.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Kernel size, must be odd.
    ///
    /// Default: `3`
    pub fn kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Number of output channels.
    ///
    /// Default: `64`
    pub fn out_channels(mut self, out_channels: usize) -> Self {
        self.out_channels = out_channels;
        self
    }

    /// Stride.
    ///
    /// Default: `1`
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Build the convolution.
    pub fn build_conv(&self, vb: VarBuilder) -> Result<SameConv2d, ConvError> {
        ensure!(
            self.kernel_size % 2 == 1,
            EvenKernelSnafu {
                kernel_size: self.kernel_size
            }
        );
        ensure!(self.stride > 0, ZeroStrideSnafu);

        let receptive_field = self.kernel_size * self.kernel_size;
        let weight = self
            .initializer
            .get(
                &vb,
                (
                    self.out_channels,
                    self.in_channels,
                    self.kernel_size,
                    self.kernel_size,
                ),
                "weight",
                self.in_channels * receptive_field,
                self.out_channels * receptive_field,
            )
            .context(ConstructionSnafu)?;
        let bias = vb
            .get_with_hints(self.out_channels, "bias", Init::Const(0.0))
            .context(ConstructionSnafu)?;

        let config = Conv2dConfig {
            padding: self.kernel_size / 2,
            stride: self.stride,
            ..Default::default()
        };

        Ok(SameConv2d {
            activation: self.activation,
            conv: Conv2d::new(weight, Some(bias), config),
        })
    }
}

impl Default for SameConv2dConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Identity,
            in_channels: 64,
            initializer: Initializer::GlorotUniform,
            kernel_size: 3,
            out_channels: 64,
            stride: 1,
        }
    }
}

impl BuildModule for SameConv2dConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(self.build_conv(vb)?))
    }
}

/// 2D convolution with same padding, followed by an activation.
///
/// Input and output have the shape `(batch_size, channels, height, width)`.
#[derive(Clone, Debug)]
pub struct SameConv2d {
    activation: Activation,
    conv: Conv2d,
}

impl Module for SameConv2d {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.activation.forward(&self.conv.forward(xs)?)
    }
}

/// Configuration for a transposed 2D convolution with same padding.
#[derive(Clone, Debug)]
pub struct SameConvTranspose2dConfig {
    activation: Activation,
    in_channels: usize,
    initializer: Initializer,
    kernel_size: usize,
    out_channels: usize,
    stride: usize,
}

impl SameConvTranspose2dConfig {
    /// Activation applied to the convolution output.
    ///
    /// Default: `Activation::Identity`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Number of input channels.
    ///
    /// Default: `64`
    pub fn in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Kernel initializer.
    ///
    /// Default: `Initializer::Normal { mean: 0.0, stdev: 0.02 }`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Kernel size, must be odd.
    ///
    /// Default: `3`
    pub fn kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Number of output channels.
    ///
    /// Default: `64`
    pub fn out_channels(mut self, out_channels: usize) -> Self {
        self.out_channels = out_channels;
        self
    }

    /// Upsampling factor.
    ///
    /// Default: `2`
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Build the transposed convolution.
    pub fn build_conv_transpose(&self, vb: VarBuilder) -> Result<SameConvTranspose2d, ConvError> {
        ensure!(
            self.kernel_size % 2 == 1,
            EvenKernelSnafu {
                kernel_size: self.kernel_size
            }
        );
        ensure!(self.stride > 0, ZeroStrideSnafu);

        let receptive_field = self.kernel_size * self.kernel_size;
        let weight = self
            .initializer
            .get(
                &vb,
                (
                    self.in_channels,
                    self.out_channels,
                    self.kernel_size,
                    self.kernel_size,
                ),
                "weight",
                self.in_channels * receptive_field,
                self.out_channels * receptive_field,
            )
            .context(ConstructionSnafu)?;
        let bias = vb
            .get_with_hints(self.out_channels, "bias", Init::Const(0.0))
            .context(ConstructionSnafu)?;

        // Output size: (size - 1) * stride - 2 * padding + kernel_size + output_padding,
        // which is size * stride for these values.
        let config = ConvTranspose2dConfig {
            padding: self.kernel_size / 2,
            output_padding: self.stride - 1,
            stride: self.stride,
            ..Default::default()
        };

        Ok(SameConvTranspose2d {
            activation: self.activation,
            conv: ConvTranspose2d::new(weight, Some(bias), config),
        })
    }
}

impl Default for SameConvTranspose2dConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Identity,
            in_channels: 64,
            initializer: Initializer::Normal {
                mean: 0.0,
                stdev: 0.02,
            },
            kernel_size: 3,
            out_channels: 64,
            stride: 2,
        }
    }
}

impl BuildModule for SameConvTranspose2dConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(self.build_conv_transpose(vb)?))
    }
}

/// Transposed 2D convolution with same padding, followed by an activation.
#[derive(Clone, Debug)]
pub struct SameConvTranspose2d {
    activation: Activation,
    conv: ConvTranspose2d,
}

impl Module for SameConvTranspose2d {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.activation.forward(&self.conv.forward(xs)?)
    }
}
