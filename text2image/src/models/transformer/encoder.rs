/// Transformer encoder.
use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::architectures::{BuildArchitecture, Encoder, EncoderOutput};
use crate::error::BoxedError;
use crate::layers::attention::{AttentionMask, SelfAttentionMask, SelfAttentionMaskError};
use crate::layers::transformer::{
    EncoderLayer, FeatureEmbeddings, FeatureEmbeddingsConfig, FeatureEmbeddingsError,
    TransformerLayerConfig, TransformerLayerError,
};

/// Transformer encoder configuration.
#[derive(Debug)]
pub struct TransformerEncoderConfig {
    embeddings: FeatureEmbeddingsConfig,
    layer: TransformerLayerConfig,
    n_hidden_layers: usize,
}

impl TransformerEncoderConfig {
    /// Encoder embeddings.
    ///
    /// Default: `FeatureEmbeddingsConfig::default()`
    pub fn embeddings(mut self, embeddings: FeatureEmbeddingsConfig) -> Self {
        self.embeddings = embeddings;
        self
    }

    /// Encoder layer.
    ///
    /// Default: `TransformerLayerConfig::default()`
    pub fn layer(mut self, layer: TransformerLayerConfig) -> Self {
        self.layer = layer;
        self
    }

    /// Number of hidden layers.
    ///
    /// Default: `4`
    pub fn n_hidden_layers(mut self, n_hidden_layers: usize) -> Self {
        self.n_hidden_layers = n_hidden_layers;
        self
    }
}

impl Default for TransformerEncoderConfig {
    fn default() -> Self {
        Self {
            embeddings: FeatureEmbeddingsConfig::default(),
            layer: TransformerLayerConfig::default(),
            n_hidden_layers: 4,
        }
    }
}

impl BuildArchitecture for TransformerEncoderConfig {
    type Architecture = TransformerEncoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let embeddings = self
            .embeddings
            .build_embeddings(vb.push_prefix("embeddings"))
            .context(BuildEmbeddingsSnafu)?;

        let layers = (0..self.n_hidden_layers)
            .map(|n| {
                self.layer
                    .build_encoder_layer(vb.push_prefix(format!("layer_{n}")))
                    .context(BuildTransformerLayerSnafu)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(n_hidden_layers = self.n_hidden_layers, "Built transformer encoder");

        Ok(TransformerEncoder { embeddings, layers })
    }
}

/// Transformer encoder errors.
#[derive(Debug, Snafu)]
pub enum TransformerEncoderError {
    #[snafu(display("Cannot build embeddings"))]
    BuildEmbeddings { source: FeatureEmbeddingsError },

    #[snafu(display("Cannot build transformer layer"))]
    BuildTransformerLayer { source: TransformerLayerError },

    #[snafu(display("Cannot apply embeddings"))]
    Embedding { source: FeatureEmbeddingsError },

    #[snafu(display("Cannot create self-attention mask"))]
    SelfAttentionMask { source: SelfAttentionMaskError },

    #[snafu(display("Cannot apply transformer layer"))]
    TransformerLayer { source: TransformerLayerError },
}

/// Encoder using the transformer architecture.
///
/// The encoder embeds continuous input features, such as the features of
/// image regions, and applies a stack of encoder layers.
pub struct TransformerEncoder {
    embeddings: FeatureEmbeddings,
    layers: Vec<EncoderLayer>,
}

impl Encoder for TransformerEncoder {
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<EncoderOutput, BoxedError> {
        let embeddings = self
            .embeddings
            .forward_t(input, train)
            .context(EmbeddingSnafu)?;
        let attention_mask =
            SelfAttentionMask::try_from(attention_mask).context(SelfAttentionMaskSnafu)?;

        let mut layer_output = embeddings;
        let mut layer_outputs = Vec::with_capacity(self.layers.len() + 1);
        for layer in &self.layers {
            let next_layer_output = layer
                .forward_t(&layer_output, Some(&attention_mask), train)
                .context(TransformerLayerSnafu)?;
            layer_outputs.push(layer_output);
            layer_output = next_layer_output;
        }
        layer_outputs.push(layer_output);

        Ok(EncoderOutput::new(layer_outputs))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::TransformerEncoderConfig;
    use crate::architectures::{BuildArchitecture, Encoder, LayerOutputs};
    use crate::layers::attention::{AttentionMask, MultiHeadAttentionConfig};
    use crate::layers::feedforward::PointwiseFeedForwardConfig;
    use crate::layers::norm::LayerNormConfig;
    use crate::layers::transformer::{FeatureEmbeddingsConfig, TransformerLayerConfig};
    use crate::util::device::tests::test_devices;

    pub(crate) fn small_encoder_config() -> TransformerEncoderConfig {
        TransformerEncoderConfig::default()
            .embeddings(
                FeatureEmbeddingsConfig::default()
                    .hidden_width(16)
                    .input_width(12),
            )
            .layer(
                TransformerLayerConfig::default()
                    .attention(MultiHeadAttentionConfig::default().hidden_width(16).n_heads(2))
                    .feedforward(
                        PointwiseFeedForwardConfig::default()
                            .hidden_width(16)
                            .intermediate_width(24),
                    )
                    .layer_norm(Box::new(LayerNormConfig::default().size(16))),
            )
            .n_hidden_layers(2)
    }

    #[test]
    #[report]
    fn encoder_returns_all_layer_outputs() -> Result<(), Whatever> {
        for device in test_devices() {
            let var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let encoder = small_encoder_config()
                .build(vb)
                .map_err(|e| Whatever::with_source(e, "Cannot build encoder".to_string()))?;

            let input = Tensor::randn(0f32, 1., (3, 64, 12), &device)
                .whatever_context("Cannot create input")?;
            let mask = AttentionMask::all_attended(3, 64, &device)
                .whatever_context("Cannot create mask")?;
            let output = encoder
                .forward_t(&input, &mask, false)
                .map_err(|e| Whatever::with_source(e, "Cannot encode input".to_string()))?;

            // Embeddings and two layers.
            assert_eq!(output.layer_outputs().len(), 3);
            for layer_output in output.layer_outputs() {
                assert_eq!(layer_output.dims(), &[3, 64, 16]);
            }
        }
        Ok(())
    }
}
