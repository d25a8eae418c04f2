use std::collections::BTreeMap;
use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::architectures::output::LayerOutputs;
use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;
use crate::layers::attention::{AttentionMask, SelfAttentionMask};

/// Attention weights of a decoder layer.
#[derive(Clone, Debug)]
pub struct DecoderAttentionWeights {
    /// Self-attention weights.
    ///
    /// *Shape:* `(batch_size, heads, seq_len, seq_len)`
    pub self_attention: Tensor,

    /// Weights of the attention over the encoder output.
    ///
    /// *Shape:* `(batch_size, heads, seq_len, encoder_seq_len)`
    pub cross_attention: Tensor,
}

/// Decoder output.
///
/// The first output is the output of the embedding layer, the remaining
/// outputs are the outputs of the decoder layers.
pub struct DecoderOutput {
    all_outputs: Vec<Tensor>,
    attention_weights: Vec<DecoderAttentionWeights>,
}

impl DecoderOutput {
    pub fn new(all_outputs: Vec<Tensor>, attention_weights: Vec<DecoderAttentionWeights>) -> Self {
        Self {
            all_outputs,
            attention_weights,
        }
    }

    /// Attention weights per decoder layer.
    pub fn attention_weights(&self) -> &[DecoderAttentionWeights] {
        &self.attention_weights
    }

    /// Attention weights by name.
    ///
    /// Self-attention weights of layer `i` (counting from 1) are named
    /// `decoder_layer{i}_block1`, weights of the attention over the
    /// encoder output `decoder_layer{i}_block2`.
    pub fn named_attention_weights(&self) -> BTreeMap<String, Tensor> {
        self.attention_weights
            .iter()
            .enumerate()
            .flat_map(|(idx, weights)| {
                [
                    (
                        format!("decoder_layer{}_block1", idx + 1),
                        weights.self_attention.clone(),
                    ),
                    (
                        format!("decoder_layer{}_block2", idx + 1),
                        weights.cross_attention.clone(),
                    ),
                ]
            })
            .collect()
    }
}

impl LayerOutputs for DecoderOutput {
    fn layer_outputs(&self) -> &[Tensor] {
        &self.all_outputs
    }

    fn embedding_layer_output(&self) -> Option<&Tensor> {
        self.all_outputs.first()
    }
}

/// Trait for building decoders.
pub trait BuildDecoder: Debug {
    /// Decoder type.
    type Decoder: Decoder;

    /// Build a decoder.
    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError>;
}

impl<D> BuildDecoder for D
where
    D: BuildArchitecture + Debug,
    D::Architecture: Decoder,
{
    type Decoder = D::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// Trait for decoders that attend to an encoder output.
pub trait Decoder {
    /// Decode an input sequence.
    ///
    /// * `piece_ids` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `encoder_output` - Output of the encoder.
    ///   *Shape:* `(batch_size, encoder_seq_len, width)`
    /// * `self_attention_mask` - Mask for decoder self-attention.
    ///   *Shape:* `(batch_size, 1, seq_len, seq_len)`
    /// * `cross_attention_mask` - Mask of the encoder output.
    ///   *Shape:* `(batch_size, encoder_seq_len)`
    /// * `train` - Whether to train the layer.
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: &SelfAttentionMask,
        cross_attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<DecoderOutput, BoxedError>;

    /// Maximum sequence length the decoder can process.
    fn max_seq_len(&self) -> usize;
}
