use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ensure, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::init::Initializer;

/// Errors for parametric ReLU.
#[derive(Debug, Snafu)]
pub enum PReLUError {
    #[snafu(display("Parametric ReLU needs at least one channel"))]
    NoChannels,
}

/// Parametric ReLU configuration.
#[derive(Clone, Debug)]
pub struct PReLUConfig {
    initializer: Initializer,
    n_channels: usize,
}

impl PReLUConfig {
    /// Initializer of the negative slopes.
    ///
    /// Default: `Initializer::Zeros`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Number of channels, one slope is learned per channel.
    ///
    /// Default: `64`
    pub fn n_channels(mut self, n_channels: usize) -> Self {
        self.n_channels = n_channels;
        self
    }

    /// Build the parametric ReLU.
    pub fn build_prelu(&self, vb: VarBuilder) -> Result<PReLU, BoxedError> {
        ensure!(self.n_channels > 0, NoChannelsSnafu);
        let alpha = self
            .initializer
            .get(&vb, self.n_channels, "alpha", 1, self.n_channels)?;
        Ok(PReLU { alpha })
    }
}

impl Default for PReLUConfig {
    fn default() -> Self {
        Self {
            initializer: Initializer::Zeros,
            n_channels: 64,
        }
    }
}

impl BuildModule for PReLUConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(self.build_prelu(vb)?))
    }
}

/// Parametric Rectified Linear Unit.
///
/// Computes `max(0, x) + alpha * min(0, x)`, where `alpha` is learned per
/// channel and shared across the remaining axes. The channel axis is the
/// second axis, so inputs have the shape `(batch_size, channels, ...)`.
///
/// See [He et al., 2015](https://arxiv.org/abs/1502.01852).
#[derive(Clone, Debug)]
pub struct PReLU {
    alpha: Tensor,
}

impl PReLU {
    /// Negative slopes.
    ///
    /// *Shape:* `(channels,)`
    pub fn alpha(&self) -> &Tensor {
        &self.alpha
    }
}

impl Module for PReLU {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let rank = xs.rank();
        if rank < 2 {
            candle_core::bail!("parametric ReLU input must have a channel axis, rank was {rank}")
        }

        let mut alpha_shape = vec![1; rank];
        alpha_shape[1] = self.alpha.dim(0)?;
        let alpha = self.alpha.reshape(alpha_shape)?;

        let negative = xs.neg()?.relu()?.broadcast_mul(&alpha)?;
        xs.relu()?.sub(&negative)
    }
}
