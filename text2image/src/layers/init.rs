//! Parameter initialization.
use candle_core::Shape;
use candle_nn::{Embedding, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Parameter initializers.
///
/// Fan-dependent initializers get their fan-in and fan-out from the
/// parameter shape, see [`Initializer::init`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// Glorot/Xavier uniform initialization.
    ///
    /// Samples from `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
    ///
    /// See [Glorot and Bengio, 2010](https://proceedings.mlr.press/v9/glorot10a.html).
    GlorotUniform,

    /// Normal distribution.
    Normal { mean: f64, stdev: f64 },

    /// Uniform distribution in `[lo, up)`.
    Uniform { lo: f64, up: f64 },

    /// All ones.
    Ones,

    /// All zeros.
    Zeros,
}

impl Initializer {
    /// Get the candle initializer for a parameter.
    ///
    /// * `fan_in` - Number of input units of the parameter.
    /// * `fan_out` - Number of output units of the parameter.
    pub fn init(&self, fan_in: usize, fan_out: usize) -> Init {
        match *self {
            Initializer::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                Init::Uniform {
                    lo: -limit,
                    up: limit,
                }
            }
            Initializer::Normal { mean, stdev } => Init::Randn { mean, stdev },
            Initializer::Uniform { lo, up } => Init::Uniform { lo, up },
            Initializer::Ones => Init::Const(1.0),
            Initializer::Zeros => Init::Const(0.0),
        }
    }

    /// Get a parameter with this initializer.
    ///
    /// * `vb` - Variable store.
    /// * `shape` - Parameter shape.
    /// * `name` - Parameter name.
    /// * `fan_in` - Number of input units of the parameter.
    /// * `fan_out` - Number of output units of the parameter.
    pub fn get(
        &self,
        vb: &VarBuilder,
        shape: impl Into<Shape>,
        name: &str,
        fan_in: usize,
        fan_out: usize,
    ) -> candle_core::Result<candle_core::Tensor> {
        vb.get_with_hints(shape, name, self.init(fan_in, fan_out))
    }
}

/// Construct a linear layer with the given weight initializer.
///
/// Biases are always initialized to zero.
///
/// * `in_width` - Input width.
/// * `out_width` - Output width.
/// * `use_bias` - Add a bias to the affine transformation.
/// * `initializer` - Weight initializer.
/// * `vb` - Variable store.
pub fn linear(
    in_width: usize,
    out_width: usize,
    use_bias: bool,
    initializer: Initializer,
    vb: VarBuilder,
) -> candle_core::Result<Linear> {
    let weight = initializer.get(&vb, (out_width, in_width), "weight", in_width, out_width)?;
    let bias = if use_bias {
        Some(vb.get_with_hints(out_width, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Construct an embedding table with the given initializer.
///
/// * `n_embeddings` - Number of rows in the table.
/// * `width` - Embedding width.
/// * `initializer` - Table initializer.
/// * `vb` - Variable store.
pub fn embedding(
    n_embeddings: usize,
    width: usize,
    initializer: Initializer,
    vb: VarBuilder,
) -> candle_core::Result<Embedding> {
    let embeddings = initializer.get(&vb, (n_embeddings, width), "weight", n_embeddings, width)?;
    Ok(Embedding::new(embeddings, width))
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Module, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, OptionExt, ResultExt, Whatever};

    use super::{linear, Initializer};

    #[test]
    #[report]
    fn glorot_uniform_respects_limit() -> Result<(), Whatever> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let layer = linear(30, 50, true, Initializer::GlorotUniform, vb)
            .whatever_context("Cannot construct linear layer")?;

        let limit = (6.0f32 / 80.0).sqrt();
        let max_abs = layer
            .weight()
            .abs()
            .and_then(|xs| xs.max_all())
            .and_then(|xs| xs.to_scalar::<f32>())
            .whatever_context("Cannot get maximum weight")?;
        assert!(max_abs <= limit);

        let bias = layer
            .bias()
            .whatever_context("Layer should have a bias")?
            .to_vec1::<f32>()
            .whatever_context("Cannot convert bias")?;
        assert!(bias.iter().all(|&b| b == 0.0));

        Ok(())
    }

    #[test]
    #[report]
    fn ones_initializer_sums_input() -> Result<(), Whatever> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let layer = linear(3, 2, false, Initializer::Ones, vb)
            .whatever_context("Cannot construct linear layer")?;
        let output = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu)
            .and_then(|xs| layer.forward(&xs))
            .and_then(|xs| xs.to_vec2::<f32>())
            .whatever_context("Cannot apply linear layer")?;
        assert_eq!(output, vec![vec![6., 6.]]);
        Ok(())
    }
}
