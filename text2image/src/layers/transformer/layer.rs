use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionOutput, MultiHeadAttention, MultiHeadAttentionConfig, MultiHeadAttentionError,
    SelfAttentionMask,
};
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::norm::LayerNormConfig;

/// Transformer layer configuration.
///
/// The same configuration is used to build encoder and decoder layers.
/// Decoder layers use the attention configuration for both self-attention
/// and attention over the encoder output.
#[derive(Debug)]
pub struct TransformerLayerConfig {
    attention: MultiHeadAttentionConfig,
    dropout: Box<dyn BuildModule>,
    feedforward: PointwiseFeedForwardConfig,
    layer_norm: Box<dyn BuildModule>,
}

impl TransformerLayerConfig {
    /// Attention configuration.
    ///
    /// Default: `MultiHeadAttentionConfig::default()`
    pub fn attention(mut self, attention: MultiHeadAttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    /// Dropout applied to the attention and feed-forward outputs before
    /// the residual connections.
    ///
    /// Default: `DropoutConfig::default()`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Feed-forward layer configuration.
    ///
    /// Default: `PointwiseFeedForwardConfig::default()`
    pub fn feedforward(mut self, feedforward: PointwiseFeedForwardConfig) -> Self {
        self.feedforward = feedforward;
        self
    }

    /// Layer norm applied after each residual connection.
    ///
    /// Default: `LayerNormConfig::default()`
    pub fn layer_norm(mut self, layer_norm: Box<dyn BuildModule>) -> Self {
        self.layer_norm = layer_norm;
        self
    }

    /// Build an encoder layer.
    pub fn build_encoder_layer(&self, vb: VarBuilder) -> Result<EncoderLayer, TransformerLayerError> {
        Ok(EncoderLayer {
            attention: self
                .attention
                .build_attention(vb.push_prefix("attention"))
                .context(BuildAttentionSnafu)?,
            attn_dropout: self.build_dropout(&vb)?,
            attn_residual_layer_norm: self
                .layer_norm
                .build(vb.push_prefix("attn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
            ffn: self
                .feedforward
                .build(vb.push_prefix("ffn"))
                .context(BuildFeedForwardSnafu)?,
            ffn_dropout: self.build_dropout(&vb)?,
            ffn_residual_layer_norm: self
                .layer_norm
                .build(vb.push_prefix("ffn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
        })
    }

    /// Build a decoder layer.
    pub fn build_decoder_layer(&self, vb: VarBuilder) -> Result<DecoderLayer, TransformerLayerError> {
        Ok(DecoderLayer {
            self_attention: self
                .attention
                .build_attention(vb.push_prefix("self_attention"))
                .context(BuildAttentionSnafu)?,
            self_attn_dropout: self.build_dropout(&vb)?,
            self_attn_residual_layer_norm: self
                .layer_norm
                .build(vb.push_prefix("self_attn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
            cross_attention: self
                .attention
                .build_attention(vb.push_prefix("cross_attention"))
                .context(BuildAttentionSnafu)?,
            cross_attn_dropout: self.build_dropout(&vb)?,
            cross_attn_residual_layer_norm: self
                .layer_norm
                .build(vb.push_prefix("cross_attn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
            ffn: self
                .feedforward
                .build(vb.push_prefix("ffn"))
                .context(BuildFeedForwardSnafu)?,
            ffn_dropout: self.build_dropout(&vb)?,
            ffn_residual_layer_norm: self
                .layer_norm
                .build(vb.push_prefix("ffn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
        })
    }

    fn build_dropout(&self, vb: &VarBuilder) -> Result<Box<dyn ModuleT>, TransformerLayerError> {
        self.dropout.build(vb.clone()).context(BuildDropoutSnafu)
    }
}

impl Default for TransformerLayerConfig {
    fn default() -> Self {
        Self {
            attention: MultiHeadAttentionConfig::default(),
            dropout: Box::new(DropoutConfig::default()),
            feedforward: PointwiseFeedForwardConfig::default(),
            layer_norm: Box::new(LayerNormConfig::default()),
        }
    }
}

/// Errors for transformer layers.
#[derive(Debug, Snafu)]
pub enum TransformerLayerError {
    #[snafu(display("Cannot apply attention"))]
    Attention { source: MultiHeadAttentionError },

    #[snafu(display("Cannot build attention layer"))]
    BuildAttention { source: MultiHeadAttentionError },

    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: BoxedError },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: BoxedError },

    #[snafu(display("Cannot apply point-wise feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },
}

/// Apply dropout to `output`, add `residual` and normalize.
fn residual_norm(
    residual: &Tensor,
    output: &Tensor,
    dropout: &dyn ModuleT,
    layer_norm: &dyn ModuleT,
    train: bool,
) -> Result<Tensor, TransformerLayerError> {
    dropout
        .forward_t(output, train)
        .and_then(|xs| residual + xs)
        .and_then(|xs| layer_norm.forward_t(&xs, train))
        .context(ResidualSnafu)
}

/// Transformer encoder layer.
///
/// Post-norm layer: normalization is applied after each residual
/// connection.
///
/// See [Vaswani et al. (2017)](https://arxiv.org/abs/1706.03762).
pub struct EncoderLayer {
    attention: MultiHeadAttention,
    attn_dropout: Box<dyn ModuleT>,
    attn_residual_layer_norm: Box<dyn ModuleT>,
    ffn: Box<dyn ModuleT>,
    ffn_dropout: Box<dyn ModuleT>,
    ffn_residual_layer_norm: Box<dyn ModuleT>,
}

impl EncoderLayer {
    /// Apply the encoder layer to the given hidden representations.
    ///
    /// * `input` - Hidden representations to apply the layer to.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `attention_mask` - Attention mask. Sequence elements for which the
    ///    corresponding mask element is set to `false` are ignored
    ///    during attention calculation.
    /// * `train` - Whether to train the layer.
    ///
    /// Returns layer output.
    /// *Shape:* ``(batch_size, seq_len, width)``
    pub fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: Option<&SelfAttentionMask>,
        train: bool,
    ) -> Result<Tensor, TransformerLayerError> {
        let AttentionOutput { output: attn, .. } = self
            .attention
            .forward_t(input, input, attention_mask, train)
            .context(AttentionSnafu)?;
        let hidden = residual_norm(
            input,
            &attn,
            self.attn_dropout.as_ref(),
            self.attn_residual_layer_norm.as_ref(),
            train,
        )?;

        let ffn_out = self
            .ffn
            .forward_t(&hidden, train)
            .context(FeedForwardSnafu)?;
        residual_norm(
            &hidden,
            &ffn_out,
            self.ffn_dropout.as_ref(),
            self.ffn_residual_layer_norm.as_ref(),
            train,
        )
    }
}

/// Output of a decoder layer.
pub struct DecoderLayerOutput {
    /// Layer output.
    ///
    /// *Shape:* `(batch_size, seq_len, width)`
    pub output: Tensor,

    /// Self-attention weights.
    ///
    /// *Shape:* `(batch_size, heads, seq_len, seq_len)`
    pub self_attention_weights: Tensor,

    /// Weights of the attention over the encoder output.
    ///
    /// *Shape:* `(batch_size, heads, seq_len, encoder_seq_len)`
    pub cross_attention_weights: Tensor,
}

/// Transformer decoder layer.
///
/// Post-norm layer with self-attention, attention over the encoder output
/// and a feed-forward layer.
///
/// See [Vaswani et al. (2017)](https://arxiv.org/abs/1706.03762).
pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    self_attn_dropout: Box<dyn ModuleT>,
    self_attn_residual_layer_norm: Box<dyn ModuleT>,
    cross_attention: MultiHeadAttention,
    cross_attn_dropout: Box<dyn ModuleT>,
    cross_attn_residual_layer_norm: Box<dyn ModuleT>,
    ffn: Box<dyn ModuleT>,
    ffn_dropout: Box<dyn ModuleT>,
    ffn_residual_layer_norm: Box<dyn ModuleT>,
}

impl DecoderLayer {
    /// Apply the decoder layer to the given piece hidden representations.
    ///
    /// * `input` - Hidden representations to apply the layer to.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `encoder_output` - Output of the encoder.
    ///   *Shape:* `(batch_size, encoder_seq_len, width)`
    /// * `self_attention_mask` - Mask for self-attention, normally a
    ///   look-ahead mask combined with the padding mask of the input.
    /// * `cross_attention_mask` - Mask of the encoder output.
    /// * `train` - Whether to train the layer.
    pub fn forward_t(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: Option<&SelfAttentionMask>,
        cross_attention_mask: Option<&SelfAttentionMask>,
        train: bool,
    ) -> Result<DecoderLayerOutput, TransformerLayerError> {
        let AttentionOutput {
            output: attn,
            weights: self_attention_weights,
        } = self
            .self_attention
            .forward_t(input, input, self_attention_mask, train)
            .context(AttentionSnafu)?;
        let hidden = residual_norm(
            input,
            &attn,
            self.self_attn_dropout.as_ref(),
            self.self_attn_residual_layer_norm.as_ref(),
            train,
        )?;

        let AttentionOutput {
            output: attn,
            weights: cross_attention_weights,
        } = self
            .cross_attention
            .forward_t(&hidden, encoder_output, cross_attention_mask, train)
            .context(AttentionSnafu)?;
        let hidden = residual_norm(
            &hidden,
            &attn,
            self.cross_attn_dropout.as_ref(),
            self.cross_attn_residual_layer_norm.as_ref(),
            train,
        )?;

        let ffn_out = self
            .ffn
            .forward_t(&hidden, train)
            .context(FeedForwardSnafu)?;
        let output = residual_norm(
            &hidden,
            &ffn_out,
            self.ffn_dropout.as_ref(),
            self.ffn_residual_layer_norm.as_ref(),
            train,
        )?;

        Ok(DecoderLayerOutput {
            output,
            self_attention_weights,
            cross_attention_weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, IndexOp, Tensor, D};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::TransformerLayerConfig;
    use crate::layers::attention::{MultiHeadAttentionConfig, SelfAttentionMask};
    use crate::layers::feedforward::PointwiseFeedForwardConfig;
    use crate::layers::norm::LayerNormConfig;
    use crate::util::device::tests::test_devices;

    fn small_config() -> TransformerLayerConfig {
        TransformerLayerConfig::default()
            .attention(MultiHeadAttentionConfig::default().hidden_width(16).n_heads(4))
            .feedforward(
                PointwiseFeedForwardConfig::default()
                    .hidden_width(16)
                    .intermediate_width(32),
            )
            .layer_norm(Box::new(LayerNormConfig::default().size(16)))
    }

    #[test]
    #[report]
    fn encoder_layer_output_is_normalized() -> Result<(), Whatever> {
        for device in test_devices() {
            let var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let layer = small_config()
                .build_encoder_layer(vb)
                .whatever_context("Cannot build encoder layer")?;

            let input = Tensor::randn(0f32, 1., (2, 7, 16), &device)
                .whatever_context("Cannot create input")?;
            let output = layer
                .forward_t(&input, None, false)
                .whatever_context("Cannot apply encoder layer")?;
            assert_eq!(output.dims(), &[2, 7, 16]);

            let means = output
                .mean(D::Minus1)
                .and_then(|xs| xs.flatten_all())
                .and_then(|xs| xs.to_vec1::<f32>())
                .whatever_context("Cannot compute means")?;
            for mean in means {
                approx::assert_abs_diff_eq!(mean, 0., epsilon = 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    #[report]
    fn decoder_layer_is_causal() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let layer = small_config()
            .build_decoder_layer(vb)
            .whatever_context("Cannot build decoder layer")?;

        let encoder_output = Tensor::randn(0f32, 1., (1, 6, 16), &device)
            .whatever_context("Cannot create encoder output")?;
        let input = Tensor::randn(0f32, 1., (1, 4, 16), &device)
            .whatever_context("Cannot create input")?;
        let mask = SelfAttentionMask::look_ahead(4, 4, &device)
            .whatever_context("Cannot create look-ahead mask")?;

        let output = layer
            .forward_t(&input, &encoder_output, Some(&mask), None, false)
            .whatever_context("Cannot apply decoder layer")?;
        assert_eq!(output.output.dims(), &[1, 4, 16]);
        assert_eq!(output.self_attention_weights.dims(), &[1, 4, 4, 4]);
        assert_eq!(output.cross_attention_weights.dims(), &[1, 4, 4, 6]);

        // Changing the last position must not change earlier outputs.
        let changed = Tensor::cat(
            &[
                input.i((.., ..3)).whatever_context("Cannot slice input")?,
                Tensor::randn(0f32, 1., (1, 1, 16), &device)
                    .whatever_context("Cannot create replacement")?,
            ],
            1,
        )
        .whatever_context("Cannot concatenate input")?;
        let changed_output = layer
            .forward_t(&changed, &encoder_output, Some(&mask), None, false)
            .whatever_context("Cannot apply decoder layer")?;

        let prefix = |xs: &Tensor| {
            xs.i((.., ..3))
                .and_then(|xs| xs.flatten_all())
                .and_then(|xs| xs.to_vec1::<f32>())
        };
        let expected = prefix(&output.output).whatever_context("Cannot get prefix")?;
        let got = prefix(&changed_output.output).whatever_context("Cannot get prefix")?;
        for (a, b) in expected.into_iter().zip(got) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }

        Ok(())
    }
}
