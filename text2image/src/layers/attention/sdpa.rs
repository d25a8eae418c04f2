use candle_core::{ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionOutput, AttentionScorer, BuildAttentionScorer, SelfAttentionMask,
    SelfAttentionMaskError,
};
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;

/// Configuration for scaled dot-product attention.
#[derive(Debug)]
pub struct ScaledDotProductAttentionConfig {
    dropout: Box<dyn BuildModule>,
}

impl ScaledDotProductAttentionConfig {
    /// Dropout to apply to the attention probabilities.
    ///
    /// Default: `Identity`.
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }
}

impl Default for ScaledDotProductAttentionConfig {
    fn default() -> Self {
        Self {
            dropout: Box::new(Identity),
        }
    }
}

impl BuildAttentionScorer for ScaledDotProductAttentionConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn AttentionScorer>, BoxedError> {
        Ok(Box::new(ScaledDotProductAttention {
            dropout: self.dropout.build(vb).context(BuildDropoutSnafu)?,
        }))
    }
}

/// Errors for scaled dot-product attention.
#[derive(Debug, Snafu)]
pub enum ScaledDotProductAttentionError {
    #[snafu(display("Cannot apply attention mask"))]
    AttentionMask { source: SelfAttentionMaskError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention probabilities"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot build dropout module"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot apply softmax"))]
    Softmax { source: candle_core::Error },
}

/// Scaled dot-product attention.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct ScaledDotProductAttention {
    dropout: Box<dyn ModuleT>,
}

impl AttentionScorer for ScaledDotProductAttention {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&SelfAttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, BoxedError> {
        let head_width = query.dim(D::Minus1).context(AttentionScoresSnafu)?;

        let mut attn_scores = key
            .transpose(D::Minus2, D::Minus1)
            .and_then(|key_t| key_t.contiguous())
            .and_then(|key_t| query.matmul(&key_t))
            .and_then(|scores| scores.affine(1. / (head_width as f64).sqrt(), 0.))
            .context(AttentionScoresSnafu)?;

        if let Some(attention_mask) = attention_mask {
            attn_scores = attention_mask
                .apply_logit_mask(&attn_scores)
                .context(AttentionMaskSnafu)?;
        }

        let weights = softmax(&attn_scores, D::Minus1).context(SoftmaxSnafu)?;
        let weights = self
            .dropout
            .forward_t(&weights, train)
            .context(DropoutSnafu)?;

        let output = weights.matmul(value).context(AttentionWeightSnafu)?;

        Ok(AttentionOutput { output, weights })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;
    use ndarray::array;
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::ScaledDotProductAttentionConfig;
    use crate::layers::attention::{AttentionMask, BuildAttentionScorer, SelfAttentionMask};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::assert_tensor_eq;

    fn key_value(device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let key = Tensor::new(
            &[[10f32, 0., 0.], [0., 10., 0.], [0., 0., 10.], [0., 0., 10.]],
            device,
        )?
        .reshape((1, 1, 4, 3))?;
        let value = Tensor::new(&[[1f32, 0.], [10., 0.], [100., 5.], [1000., 6.]], device)?
            .reshape((1, 1, 4, 2))?;
        Ok((key, value))
    }

    #[test]
    #[report]
    fn sdpa_attends_to_matching_keys() -> Result<(), Whatever> {
        for device in test_devices() {
            let scorer = ScaledDotProductAttentionConfig::default()
                .build(VarBuilder::zeros(DType::F32, &device))
                .map_err(|e| Whatever::with_source(e, "Cannot build attention scorer".to_string()))?;
            let (key, value) = key_value(&device).whatever_context("Cannot create key/value")?;

            let query = Tensor::new(&[[0f32, 10., 0.], [0., 0., 10.]], &device)
                .and_then(|xs| xs.reshape((1, 1, 2, 3)))
                .whatever_context("Cannot create query")?;
            let attention = scorer
                .forward(&query, &key, &value, None, false)
                .map_err(|e| Whatever::with_source(e, "Cannot apply attention".to_string()))?;

            assert_tensor_eq!(
                attention
                    .output
                    .squeeze(0)
                    .and_then(|xs| xs.squeeze(0))
                    .whatever_context("Cannot squeeze output")?,
                array![[10f32, 0.], [550., 5.5]],
                epsilon = 1e-3,
            );
            assert_tensor_eq!(
                attention
                    .weights
                    .squeeze(0)
                    .and_then(|xs| xs.squeeze(0))
                    .whatever_context("Cannot squeeze weights")?,
                array![[0f32, 1., 0., 0.], [0., 0., 0.5, 0.5]],
                epsilon = 1e-4,
            );
        }

        Ok(())
    }

    #[test]
    #[report]
    fn sdpa_ignores_masked_keys() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let scorer = ScaledDotProductAttentionConfig::default()
            .build(VarBuilder::zeros(DType::F32, &device))
            .map_err(|e| Whatever::with_source(e, "Cannot build attention scorer".to_string()))?;
        let (key, value) = key_value(&device).whatever_context("Cannot create key/value")?;
        let query = Tensor::new(&[[0f32, 0., 10.]], &device)
            .and_then(|xs| xs.reshape((1, 1, 1, 3)))
            .whatever_context("Cannot create query")?;

        let mask = AttentionMask::new(
            Tensor::new(&[[1u8, 1, 1, 0]], &device).whatever_context("Cannot create mask")?,
        )
        .whatever_context("Cannot create attention mask")?;
        let mask =
            SelfAttentionMask::try_from(&mask).whatever_context("Cannot create 4D mask")?;

        let attention = scorer
            .forward(&query, &key, &value, Some(&mask), false)
            .map_err(|e| Whatever::with_source(e, "Cannot apply attention".to_string()))?;

        assert_tensor_eq!(
            attention
                .output
                .reshape((1, 2))
                .whatever_context("Cannot reshape output")?,
            array![[100f32, 5.]],
            epsilon = 1e-3,
        );

        Ok(())
    }
}
