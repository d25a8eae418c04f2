use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Activation functions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Gaussian Error Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    Gelu,

    /// No activation.
    Identity,

    /// Leaky Rectified Linear Unit.
    ///
    /// Negative inputs are multiplied by `negative_slope`.
    ///
    /// See [Maas et al., 2013](https://ai.stanford.edu/~amaas/papers/relu_hybrid_icml2013_final.pdf).
    LeakyRelu { negative_slope: f64 },

    /// Rectified Linear Unit.
    ///
    /// See [Fukushima, 1969](https://ieeexplore.ieee.org/document/4082265).
    Relu,

    /// Hyperbolic tangent.
    Tanh,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match *self {
            Activation::Gelu => xs.gelu_erf(),
            Activation::Identity => Ok(xs.clone()),
            Activation::LeakyRelu { negative_slope } => {
                // relu(x) - slope * relu(-x)
                let negative = (xs.neg()?.relu()? * negative_slope)?;
                xs.relu()?.sub(&negative)
            }
            Activation::Relu => xs.relu(),
            Activation::Tanh => xs.tanh(),
        }
    }
}

impl BuildModule for Activation {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(*self))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Module, Tensor};
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::Activation;

    #[rstest]
    #[case(Activation::Identity, [-2.0, -0.5, 0.0, 1.5])]
    #[case(Activation::Relu, [0.0, 0.0, 0.0, 1.5])]
    #[case(Activation::LeakyRelu { negative_slope: 0.2 }, [-0.4, -0.1, 0.0, 1.5])]
    fn activation_produces_correct_output(
        #[case] activation: Activation,
        #[case] expected: [f32; 4],
    ) -> Result<(), Whatever> {
        let output = Tensor::new(&[-2f32, -0.5, 0.0, 1.5], &Device::Cpu)
            .and_then(|xs| activation.forward(&xs))
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot apply activation")?;
        for (out, exp) in output.iter().zip(expected) {
            approx::assert_abs_diff_eq!(*out, exp, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    #[report]
    fn tanh_is_bounded() -> Result<(), Whatever> {
        let output = Tensor::new(&[-100f32, 0.0, 100.0], &Device::Cpu)
            .and_then(|xs| Activation::Tanh.forward(&xs))
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot apply tanh")?;
        assert!(output.iter().all(|x| (-1.0..=1.0).contains(x)));
        Ok(())
    }

    #[test]
    fn activation_deserializes_from_snake_case() {
        let activation: Activation =
            serde_json::from_str(r#"{"leaky_relu":{"negative_slope":0.2}}"#).unwrap();
        assert_eq!(
            activation,
            Activation::LeakyRelu {
                negative_slope: 0.2
            }
        );
        let activation: Activation = serde_json::from_str(r#""relu""#).unwrap();
        assert_eq!(activation, Activation::Relu);
    }
}
