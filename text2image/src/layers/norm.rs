use candle_core::ModuleT;
use candle_nn::{
    batch_norm, layer_norm, BatchNormConfig as CandleBatchNormConfig,
    LayerNormConfig as CandleLayerNormConfig, VarBuilder,
};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Layer norm configuration.
#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    pub affine: bool,
    pub eps: f64,
    pub size: usize,
}

impl LayerNormConfig {
    /// Whether to use an affine transformation.
    ///
    /// Default: `true`
    pub fn affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    /// Epsilon value.
    ///
    /// Default: `1e-6`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Dimensionality of the layer.
    ///
    /// Default: `512`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            affine: true,
            eps: 1e-6,
            size: 512,
        }
    }
}

impl BuildModule for LayerNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(layer_norm(
            self.size,
            CandleLayerNormConfig {
                affine: self.affine,
                eps: self.eps,
                remove_mean: true,
            },
            vb,
        )?))
    }
}

/// Batch norm configuration.
///
/// Normalizes over the batch and spatial axes of `(batch_size, channels,
/// height, width)` inputs. During training the batch statistics are used
/// and the running statistics are updated, otherwise the running
/// statistics are used.
#[derive(Clone, Debug)]
pub struct BatchNormConfig {
    pub eps: f64,
    pub momentum: f64,
    pub size: usize,
}

impl BatchNormConfig {
    /// Epsilon value.
    ///
    /// Default: `1e-3`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Weight of the batch statistics when updating the running statistics.
    ///
    /// Default: `0.5`
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Number of channels.
    ///
    /// Default: `64`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-3,
            momentum: 0.5,
            size: 64,
        }
    }
}

impl BuildModule for BatchNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(batch_norm(
            self.size,
            CandleBatchNormConfig {
                eps: self.eps,
                remove_mean: true,
                affine: true,
                momentum: self.momentum,
            },
            vb,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor, D};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::{BatchNormConfig, LayerNormConfig};
    use crate::layers::build_module::BuildModule;

    #[test]
    #[report]
    fn layer_norm_normalizes_last_dimension() -> Result<(), Whatever> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let norm = LayerNormConfig::default()
            .size(4)
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build layer norm".to_string()))?;

        let output = Tensor::new(&[[1f32, 2., 3., 4.], [10., 20., 30., 40.]], &Device::Cpu)
            .and_then(|xs| norm.forward_t(&xs, false))
            .whatever_context("Cannot apply layer norm")?;
        let means = output
            .mean(D::Minus1)
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot compute means")?;
        for mean in means {
            approx::assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
        }

        Ok(())
    }

    #[test]
    #[report]
    fn batch_norm_uses_batch_statistics_in_training() -> Result<(), Whatever> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let norm = BatchNormConfig::default()
            .size(2)
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build batch norm".to_string()))?;

        let input = Tensor::arange(0f32, 16., &Device::Cpu)
            .and_then(|xs| xs.reshape((2, 2, 2, 2)))
            .whatever_context("Cannot create input")?;
        let output = norm
            .forward_t(&input, true)
            .whatever_context("Cannot apply batch norm")?;
        let channel_means = output
            .transpose(0, 1)
            .and_then(|xs| xs.flatten_from(1))
            .and_then(|xs| xs.mean(1))
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot compute channel means")?;
        for mean in channel_means {
            approx::assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
        }

        Ok(())
    }
}
