use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildArchitecture, DecoderOutput, EncoderOutput, LayerOutputs};
use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionMask, AttentionMaskError, SelfAttentionMask, SelfAttentionMaskError,
};

/// Errors for sequence-to-sequence masks.
#[derive(Debug, Snafu)]
pub enum Seq2SeqMasksError {
    #[snafu(display("Cannot create decoder mask"))]
    DecoderMask { source: SelfAttentionMaskError },

    #[snafu(display("Cannot create encoder mask"))]
    EncoderMask { source: AttentionMaskError },

    #[snafu(display("Cannot get input shape"))]
    InputShape { source: candle_core::Error },
}

/// Attention masks of a sequence-to-sequence model.
#[derive(Clone, Debug)]
pub struct Seq2SeqMasks {
    encoder: AttentionMask,
    decoder: SelfAttentionMask,
}

impl Seq2SeqMasks {
    /// Create masks from their parts.
    ///
    /// * `encoder` - Mask of the encoder input, also used for attention
    ///   over the encoder output.
    /// * `decoder` - Mask for decoder self-attention.
    pub fn new(encoder: AttentionMask, decoder: SelfAttentionMask) -> Self {
        Seq2SeqMasks { encoder, decoder }
    }

    /// Create the standard masks for the given inputs.
    ///
    /// * `input` - Encoder input.
    ///   *Shape:* `(batch_size, seq_len, input_width)`
    /// * `piece_ids` - Decoder piece identifiers.
    ///   *Shape:* `(batch_size, target_len)`
    /// * `encoder_mask` - Mask of the encoder input. When absent, all
    ///   encoder inputs are attended to.
    ///
    /// The decoder mask combines a look-ahead mask with the padding mask
    /// of `piece_ids`.
    pub fn for_inputs(
        input: &Tensor,
        piece_ids: &Tensor,
        encoder_mask: Option<AttentionMask>,
    ) -> Result<Self, Seq2SeqMasksError> {
        let encoder = match encoder_mask {
            Some(encoder_mask) => encoder_mask,
            None => {
                let (batch_size, seq_len, _) = input.dims3().context(InputShapeSnafu)?;
                AttentionMask::all_attended(batch_size, seq_len, input.device())
                    .context(EncoderMaskSnafu)?
            }
        };
        let decoder = SelfAttentionMask::for_decoder(piece_ids).context(DecoderMaskSnafu)?;
        Ok(Seq2SeqMasks { encoder, decoder })
    }

    /// Mask of the encoder input and output.
    pub fn encoder(&self) -> &AttentionMask {
        &self.encoder
    }

    /// Mask for decoder self-attention.
    pub fn decoder(&self) -> &SelfAttentionMask {
        &self.decoder
    }
}

/// Output of decoding with a sequence-to-sequence model.
pub struct Seq2SeqDecodeOutput {
    decoder_output: DecoderOutput,
    logits: Tensor,
}

impl Seq2SeqDecodeOutput {
    pub fn new(decoder_output: DecoderOutput, logits: Tensor) -> Self {
        Self {
            decoder_output,
            logits,
        }
    }

    /// Decoder output.
    pub fn decoder_output(&self) -> &DecoderOutput {
        &self.decoder_output
    }

    /// Logits over the output vocabulary.
    ///
    /// *Shape:* `(batch_size, target_len, n_pieces)`
    pub fn logits(&self) -> &Tensor {
        &self.logits
    }
}

/// Sequence-to-sequence model output.
pub struct Seq2SeqOutput {
    encoder_output: EncoderOutput,
    decoder_output: DecoderOutput,
    logits: Tensor,
}

impl Seq2SeqOutput {
    pub fn new(encoder_output: EncoderOutput, decode_output: Seq2SeqDecodeOutput) -> Self {
        Self {
            encoder_output,
            decoder_output: decode_output.decoder_output,
            logits: decode_output.logits,
        }
    }

    /// Encoder output.
    pub fn encoder_output(&self) -> &EncoderOutput {
        &self.encoder_output
    }

    /// Decoder output.
    pub fn decoder_output(&self) -> &DecoderOutput {
        &self.decoder_output
    }

    /// Logits over the output vocabulary.
    ///
    /// *Shape:* `(batch_size, target_len, n_pieces)`
    pub fn logits(&self) -> &Tensor {
        &self.logits
    }
}

impl LayerOutputs for Seq2SeqOutput {
    fn layer_outputs(&self) -> &[Tensor] {
        self.decoder_output.layer_outputs()
    }

    fn embedding_layer_output(&self) -> Option<&Tensor> {
        self.decoder_output.embedding_layer_output()
    }
}

/// Errors for sequence-to-sequence models.
#[derive(Debug, Snafu)]
pub enum Seq2SeqError {
    #[snafu(display("Nothing to decode from, the encoder does not have any layer outputs"))]
    NoEncoderOutput,
}

/// Trait for building sequence-to-sequence models.
pub trait BuildSeq2Seq: Debug {
    type Seq2Seq: Seq2Seq;

    /// Build a sequence-to-sequence model.
    fn build(&self, vb: VarBuilder) -> Result<Self::Seq2Seq, BoxedError>;
}

impl<S> BuildSeq2Seq for S
where
    S: BuildArchitecture + Debug,
    S::Architecture: Seq2Seq,
{
    type Seq2Seq = S::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Seq2Seq, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// Trait for sequence-to-sequence (encoder-decoder) models.
pub trait Seq2Seq {
    /// Encode the input sequence.
    ///
    /// * `input` - Encoder input.
    ///   *Shape:* `(batch_size, seq_len, input_width)`
    /// * `attention_mask` - Mask of the encoder input.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether to train the model.
    fn encode(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<EncoderOutput, BoxedError>;

    /// Decode pieces given an encoded input.
    ///
    /// * `piece_ids` - Decoder piece identifiers.
    ///   *Shape:* `(batch_size, target_len)`
    /// * `encoder_output` - Output of the last encoder layer.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `masks` - Attention masks.
    /// * `train` - Whether to train the model.
    fn decode(
        &self,
        piece_ids: &Tensor,
        encoder_output: &Tensor,
        masks: &Seq2SeqMasks,
        train: bool,
    ) -> Result<Seq2SeqDecodeOutput, BoxedError>;

    /// Maximum number of pieces that can be decoded.
    fn max_target_len(&self) -> usize;

    /// Encode the input and decode the given pieces.
    ///
    /// * `input` - Encoder input.
    ///   *Shape:* `(batch_size, seq_len, input_width)`
    /// * `piece_ids` - Decoder piece identifiers.
    ///   *Shape:* `(batch_size, target_len)`
    /// * `masks` - Attention masks.
    /// * `train` - Whether to train the model.
    fn forward_t(
        &self,
        input: &Tensor,
        piece_ids: &Tensor,
        masks: &Seq2SeqMasks,
        train: bool,
    ) -> Result<Seq2SeqOutput, BoxedError> {
        let encoder_output = self.encode(input, masks.encoder(), train)?;
        let last_layer = encoder_output
            .last_layer_output()
            .ok_or(Seq2SeqError::NoEncoderOutput)?;
        let decode_output = self.decode(piece_ids, last_layer, masks, train)?;
        Ok(Seq2SeqOutput::new(encoder_output, decode_output))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use super::Seq2SeqMasks;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn masks_for_inputs() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let input = Tensor::zeros((2, 3, 5), DType::F32, &device)
            .whatever_context("Cannot create input")?;
        let piece_ids = Tensor::new(&[[1u32, 4, 0], [1, 0, 0]], &device)
            .whatever_context("Cannot create piece identifiers")?;

        let masks = Seq2SeqMasks::for_inputs(&input, &piece_ids, None)
            .whatever_context("Cannot create masks")?;

        assert_tensor_eq!(
            masks
                .encoder()
                .bool_mask()
                .to_dtype(DType::F32)
                .whatever_context("Cannot convert mask")?,
            array![[1f32, 1., 1.], [1., 1., 1.]],
        );
        assert_tensor_eq!(
            masks
                .decoder()
                .bool_mask()
                .to_dtype(DType::F32)
                .and_then(|xs| xs.reshape((2, 3, 3)))
                .whatever_context("Cannot convert mask")?,
            array![
                [[1f32, 0., 0.], [1., 1., 0.], [1., 1., 0.]],
                [[1., 0., 0.], [1., 0., 0.], [1., 0., 0.]]
            ],
        );

        Ok(())
    }
}
