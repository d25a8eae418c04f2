/// Encoder-decoder transformer.
use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::architectures::{
    BuildArchitecture, BuildDecoder, BuildEncoder, Decoder, Encoder, EncoderOutput, LayerOutputs,
    Seq2Seq, Seq2SeqDecodeOutput, Seq2SeqMasks,
};
use crate::error::BoxedError;
use crate::layers::attention::AttentionMask;
use crate::layers::init::{linear, Initializer};
use crate::models::transformer::{
    TransformerDecoder, TransformerDecoderConfig, TransformerEncoder, TransformerEncoderConfig,
};

/// Transformer configuration.
#[derive(Debug)]
pub struct TransformerConfig {
    decoder: Box<dyn BuildDecoder<Decoder = TransformerDecoder>>,
    encoder: Box<dyn BuildEncoder<Encoder = TransformerEncoder>>,
    hidden_width: usize,
    initializer: Initializer,
    n_pieces: usize,
}

impl TransformerConfig {
    /// Decoder.
    ///
    /// Default: `TransformerDecoderConfig::default()`
    pub fn decoder(mut self, decoder: Box<dyn BuildDecoder<Decoder = TransformerDecoder>>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Encoder.
    ///
    /// Default: `TransformerEncoderConfig::default()`
    pub fn encoder(mut self, encoder: Box<dyn BuildEncoder<Encoder = TransformerEncoder>>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Hidden width of the decoder output.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Initializer of the output layer.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Number of pieces in the output vocabulary.
    ///
    /// Default: `5001`
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            decoder: Box::<TransformerDecoderConfig>::default(),
            encoder: Box::<TransformerEncoderConfig>::default(),
            hidden_width: 512,
            initializer: Initializer::GlorotUniform,
            n_pieces: 5001,
        }
    }
}

impl BuildArchitecture for TransformerConfig {
    type Architecture = Transformer;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let encoder = self
            .encoder
            .build(vb.push_prefix("encoder"))
            .context(BuildEncoderSnafu)?;
        let decoder = self
            .decoder
            .build(vb.push_prefix("decoder"))
            .context(BuildDecoderSnafu)?;
        let output_layer = linear(
            self.hidden_width,
            self.n_pieces,
            true,
            self.initializer,
            vb.push_prefix("output_layer"),
        )
        .context(BuildOutputLayerSnafu)?;

        debug!(
            hidden_width = self.hidden_width,
            n_pieces = self.n_pieces,
            "Built transformer"
        );

        Ok(Transformer {
            decoder: Box::new(decoder),
            encoder: Box::new(encoder),
            output_layer,
        })
    }
}

/// `Transformer` errors.
#[derive(Debug, Snafu)]
pub enum TransformerError {
    #[snafu(display("Cannot build decoder"))]
    BuildDecoder { source: BoxedError },

    #[snafu(display("Cannot build encoder"))]
    BuildEncoder { source: BoxedError },

    #[snafu(display("Cannot build output layer"))]
    BuildOutputLayer { source: candle_core::Error },

    #[snafu(display("Cannot compute logits for the output vocabulary"))]
    ComputeLogits { source: candle_core::Error },

    #[snafu(display("Nothing to decode, the decoder does not have any layer outputs"))]
    NoLayers,
}

/// Encoder-decoder transformer.
///
/// The encoder embeds continuous input features, the decoder predicts
/// pieces of the output vocabulary.
///
/// See [Vaswani et al. (2017)](https://arxiv.org/abs/1706.03762).
pub struct Transformer {
    decoder: Box<dyn Decoder>,
    encoder: Box<dyn Encoder>,
    output_layer: Linear,
}

impl Seq2Seq for Transformer {
    fn encode(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<EncoderOutput, BoxedError> {
        self.encoder.forward_t(input, attention_mask, train)
    }

    fn decode(
        &self,
        piece_ids: &Tensor,
        encoder_output: &Tensor,
        masks: &Seq2SeqMasks,
        train: bool,
    ) -> Result<Seq2SeqDecodeOutput, BoxedError> {
        let decoder_output = self.decoder.forward_t(
            piece_ids,
            encoder_output,
            masks.decoder(),
            masks.encoder(),
            train,
        )?;
        let last_layer = decoder_output
            .last_layer_output()
            .ok_or(TransformerError::NoLayers)?;
        let logits = self
            .output_layer
            .forward(last_layer)
            .context(ComputeLogitsSnafu)?;

        Ok(Seq2SeqDecodeOutput::new(decoder_output, logits))
    }

    fn max_target_len(&self) -> usize {
        self.decoder.max_seq_len()
    }
}
