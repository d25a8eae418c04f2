/// Transformer decoder.
use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::architectures::{BuildArchitecture, Decoder, DecoderAttentionWeights, DecoderOutput};
use crate::error::BoxedError;
use crate::layers::attention::{AttentionMask, SelfAttentionMask, SelfAttentionMaskError};
use crate::layers::transformer::{
    DecoderLayer, DecoderLayerOutput, PieceEmbeddings, PieceEmbeddingsConfig,
    PieceEmbeddingsError, TransformerLayerConfig, TransformerLayerError,
};

/// Transformer decoder configuration.
#[derive(Debug)]
pub struct TransformerDecoderConfig {
    embeddings: PieceEmbeddingsConfig,
    layer: TransformerLayerConfig,
    n_hidden_layers: usize,
}

impl TransformerDecoderConfig {
    /// Decoder embeddings.
    ///
    /// Default: `PieceEmbeddingsConfig::default()`
    pub fn embeddings(mut self, embeddings: PieceEmbeddingsConfig) -> Self {
        self.embeddings = embeddings;
        self
    }

    /// Decoder layer.
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

impl Default for TransformerDecoderConfig {
    fn default() -> Self {
        Self {
            embeddings: PieceEmbeddingsConfig::default(),
            layer: TransformerLayerConfig::default(),
            n_hidden_layers: 4,
        }
    }
}

impl BuildArchitecture for TransformerDecoderConfig {
    type Architecture = TransformerDecoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let embeddings = self
            .embeddings
            .build_embeddings(vb.push_prefix("embeddings"))
            .context(BuildEmbeddingsSnafu)?;

        let layers = (0..self.n_hidden_layers)
            .map(|n| {
                self.layer
                    .build_decoder_layer(vb.push_prefix(format!("layer_{n}")))
                    .context(BuildTransformerLayerSnafu)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(n_hidden_layers = self.n_hidden_layers, "Built transformer decoder");

        Ok(TransformerDecoder { embeddings, layers })
    }
}

/// Transformer decoder errors.
#[derive(Debug, Snafu)]
pub enum TransformerDecoderError {
    #[snafu(display("Cannot build embeddings"))]
    BuildEmbeddings { source: PieceEmbeddingsError },

    #[snafu(display("Cannot build transformer layer"))]
    BuildTransformerLayer { source: TransformerLayerError },

    #[snafu(display("Cannot create attention mask for the encoder output"))]
    CrossAttentionMask { source: SelfAttentionMaskError },

    #[snafu(display("Cannot apply embeddings"))]
    Embedding { source: PieceEmbeddingsError },

    #[snafu(display("Cannot apply transformer layer"))]
    TransformerLayer { source: TransformerLayerError },
}

/// Decoder using the transformer architecture.
///
/// Each decoder layer attends to the preceding pieces and to the
/// output of an encoder.
pub struct TransformerDecoder {
    embeddings: PieceEmbeddings,
    layers: Vec<DecoderLayer>,
}

impl Decoder for TransformerDecoder {
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: &SelfAttentionMask,
        cross_attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<DecoderOutput, BoxedError> {
        let embeddings = self
            .embeddings
            .forward_t(piece_ids, train)
            .context(EmbeddingSnafu)?;
        let cross_attention_mask =
            SelfAttentionMask::try_from(cross_attention_mask).context(CrossAttentionMaskSnafu)?;

        let mut layer_output = embeddings;
        let mut layer_outputs = Vec::with_capacity(self.layers.len() + 1);
        let mut attention_weights = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let DecoderLayerOutput {
                output,
                self_attention_weights,
                cross_attention_weights,
            } = layer
                .forward_t(
                    &layer_output,
                    encoder_output,
                    Some(self_attention_mask),
                    Some(&cross_attention_mask),
                    train,
                )
                .context(TransformerLayerSnafu)?;

            attention_weights.push(DecoderAttentionWeights {
                self_attention: self_attention_weights,
                cross_attention: cross_attention_weights,
            });
            layer_outputs.push(layer_output);
            layer_output = output;
        }
        layer_outputs.push(layer_output);

        Ok(DecoderOutput::new(layer_outputs, attention_weights))
    }

    fn max_seq_len(&self) -> usize {
        self.embeddings.n_positions()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use candle_core::{DType, Device, IndexOp, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, OptionExt, ResultExt, Whatever};

    use super::TransformerDecoderConfig;
    use crate::architectures::{BuildArchitecture, Decoder, LayerOutputs};
    use crate::layers::attention::{AttentionMask, MultiHeadAttentionConfig, SelfAttentionMask};
    use crate::layers::feedforward::PointwiseFeedForwardConfig;
    use crate::layers::norm::LayerNormConfig;
    use crate::layers::transformer::{PieceEmbeddingsConfig, TransformerLayerConfig};

    pub(crate) fn small_decoder_config() -> TransformerDecoderConfig {
        TransformerDecoderConfig::default()
            .embeddings(
                PieceEmbeddingsConfig::default()
                    .hidden_width(16)
                    .n_pieces(20)
                    .n_positions(32),
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
            .n_hidden_layers(3)
    }

    #[test]
    #[report]
    fn decoder_names_attention_weights_per_layer() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let decoder = small_decoder_config()
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build decoder".to_string()))?;

        let piece_ids = Tensor::new(&[[1u32, 5, 7, 0], [1, 9, 0, 0]], &device)
            .whatever_context("Cannot create piece identifiers")?;
        let encoder_output = Tensor::randn(0f32, 1., (2, 6, 16), &device)
            .whatever_context("Cannot create encoder output")?;
        let self_mask = SelfAttentionMask::for_decoder(&piece_ids)
            .whatever_context("Cannot create decoder mask")?;
        let cross_mask = AttentionMask::all_attended(2, 6, &device)
            .whatever_context("Cannot create encoder mask")?;

        let output = decoder
            .forward_t(&piece_ids, &encoder_output, &self_mask, &cross_mask, false)
            .map_err(|e| Whatever::with_source(e, "Cannot decode".to_string()))?;
        assert_eq!(output.layer_outputs().len(), 4);
        assert_eq!(decoder.max_seq_len(), 32);

        let weights = output.named_attention_weights();
        let names = weights.keys().cloned().collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "decoder_layer1_block1",
                "decoder_layer1_block2",
                "decoder_layer2_block1",
                "decoder_layer2_block2",
                "decoder_layer3_block1",
                "decoder_layer3_block2",
            ]
        );
        assert_eq!(weights["decoder_layer2_block1"].dims(), &[2, 2, 4, 4]);
        assert_eq!(weights["decoder_layer3_block2"].dims(), &[2, 2, 4, 6]);

        Ok(())
    }

    #[test]
    #[report]
    fn decoder_ignores_masked_encoder_positions() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let decoder = small_decoder_config()
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build decoder".to_string()))?;

        let piece_ids =
            Tensor::new(&[[1u32, 5]], &device).whatever_context("Cannot create pieces")?;
        let self_mask = SelfAttentionMask::for_decoder(&piece_ids)
            .whatever_context("Cannot create decoder mask")?;
        let cross_mask = AttentionMask::new(
            Tensor::new(&[[1u8, 1, 0]], &device).whatever_context("Cannot create mask")?,
        )
        .whatever_context("Cannot create encoder mask")?;

        let encoder_output = Tensor::randn(0f32, 1., (1, 3, 16), &device)
            .whatever_context("Cannot create encoder output")?;
        let changed_encoder_output = Tensor::cat(
            &[
                encoder_output
                    .i((.., ..2))
                    .whatever_context("Cannot slice encoder output")?,
                Tensor::randn(0f32, 1., (1, 1, 16), &device)
                    .whatever_context("Cannot create replacement")?,
            ],
            1,
        )
        .whatever_context("Cannot concatenate encoder output")?;

        let last = |encoder_output: &Tensor| -> Result<Vec<f32>, Whatever> {
            let output = decoder
                .forward_t(&piece_ids, encoder_output, &self_mask, &cross_mask, false)
                .map_err(|e| Whatever::with_source(e, "Cannot decode".to_string()))?;
            output
                .last_layer_output()
                .whatever_context("No decoder output")?
                .flatten_all()
                .and_then(|xs| xs.to_vec1::<f32>())
                .whatever_context("Cannot read decoder output")
        };

        let expected = last(&encoder_output)?;
        let got = last(&changed_encoder_output)?;
        for (a, b) in expected.into_iter().zip(got) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }

        Ok(())
    }
}
