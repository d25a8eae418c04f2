/// Greedy decoding for sequence-to-sequence models.
use candle_core::{IndexOp, Tensor, D};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::architectures::{LayerOutputs, Seq2Seq, Seq2SeqMasks};
use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionMask, AttentionMaskError, SelfAttentionMask, SelfAttentionMaskError,
};

/// Greedy decoding configuration.
#[derive(Clone, Debug)]
pub struct GreedyDecodeConfig {
    end_piece: u32,
    max_len: usize,
    start_piece: u32,
}

impl GreedyDecodeConfig {
    /// Piece that ends a sequence.
    ///
    /// Default: `2`
    pub fn end_piece(mut self, end_piece: u32) -> Self {
        self.end_piece = end_piece;
        self
    }

    /// Maximum length of a decoded sequence, including the start piece.
    ///
    /// Default: `40`
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Piece that starts every sequence.
    ///
    /// Default: `1`
    pub fn start_piece(mut self, start_piece: u32) -> Self {
        self.start_piece = start_piece;
        self
    }
}

impl Default for GreedyDecodeConfig {
    fn default() -> Self {
        Self {
            end_piece: 2,
            max_len: 40,
            start_piece: 1,
        }
    }
}

/// Greedy decoding errors.
#[derive(Debug, Snafu)]
pub enum GreedyDecodeError {
    #[snafu(display("Cannot decode pieces"))]
    Decode { source: BoxedError },

    #[snafu(display("Cannot create decoder mask"))]
    DecoderMask { source: SelfAttentionMaskError },

    #[snafu(display("Cannot encode input"))]
    Encode { source: BoxedError },

    #[snafu(display("Cannot create encoder mask"))]
    EncoderMask { source: AttentionMaskError },

    #[snafu(display("Cannot get input shape"))]
    InputShape { source: candle_core::Error },

    #[snafu(display("Maximum length must be at least 1"))]
    MaxLen,

    #[snafu(display("Nothing to decode from, the encoder does not have any layer outputs"))]
    NoEncoderOutput,

    #[snafu(display("Cannot pick the next pieces"))]
    NextPieces { source: candle_core::Error },

    #[snafu(display("Cannot create piece identifier tensor"))]
    PieceIds { source: candle_core::Error },
}

/// Greedy decoding.
///
/// Starting from the start piece, the decoder is applied repeatedly and
/// the most probable non-padding piece is appended to each sequence. A
/// sequence is finished when the end piece is predicted. Finished
/// sequences are padded with piece `0`.
pub trait GreedyDecode {
    /// Decode the given input greedily.
    ///
    /// * `input` - Encoder input.
    ///   *Shape:* `(batch_size, seq_len, input_width)`
    /// * `encoder_mask` - Mask of the encoder input. When absent, all
    ///   encoder inputs are attended to.
    /// * `config` - Decoding configuration.
    ///
    /// Returns: decoded pieces, starting with the start piece.
    /// *Shape:* `(batch_size, decoded_len)`
    fn greedy_decode(
        &self,
        input: &Tensor,
        encoder_mask: Option<AttentionMask>,
        config: &GreedyDecodeConfig,
    ) -> Result<Tensor, GreedyDecodeError>;
}

impl<S> GreedyDecode for S
where
    S: Seq2Seq,
{
    fn greedy_decode(
        &self,
        input: &Tensor,
        encoder_mask: Option<AttentionMask>,
        config: &GreedyDecodeConfig,
    ) -> Result<Tensor, GreedyDecodeError> {
        ensure!(config.max_len > 0, MaxLenSnafu);

        let (batch_size, seq_len, _) = input.dims3().context(InputShapeSnafu)?;
        let device = input.device();
        let encoder_mask = match encoder_mask {
            Some(encoder_mask) => encoder_mask,
            None => AttentionMask::all_attended(batch_size, seq_len, device)
                .context(EncoderMaskSnafu)?,
        };

        let encoder_output = self
            .encode(input, &encoder_mask, false)
            .context(EncodeSnafu)?;
        let encoder_output = encoder_output
            .last_layer_output()
            .context(NoEncoderOutputSnafu)?;

        let max_len = config.max_len.min(self.max_target_len());
        let mut sequences = vec![vec![config.start_piece]; batch_size];
        let mut finished = vec![false; batch_size];

        for step in 1..max_len {
            let piece_ids = Tensor::from_iter(sequences.iter().flatten().copied(), device)
                .and_then(|xs| xs.reshape((batch_size, step)))
                .context(PieceIdsSnafu)?;
            let decoder_mask =
                SelfAttentionMask::for_decoder(&piece_ids).context(DecoderMaskSnafu)?;
            let masks = Seq2SeqMasks::new(encoder_mask.clone(), decoder_mask);

            let output = self
                .decode(&piece_ids, encoder_output, &masks, false)
                .context(DecodeSnafu)?;
            // Padding is never predicted, the argmax skips piece 0.
            let next_pieces = output
                .logits()
                .i((.., step - 1))
                .and_then(|logits| {
                    let n_pieces = logits.dim(D::Minus1)?;
                    logits.narrow(D::Minus1, 1, n_pieces.saturating_sub(1))
                })
                .and_then(|logits| logits.argmax(D::Minus1))
                .and_then(|pieces| pieces.to_vec1::<u32>())
                .context(NextPiecesSnafu)?;

            for ((sequence, done), next_piece) in
                sequences.iter_mut().zip(finished.iter_mut()).zip(next_pieces)
            {
                if *done {
                    sequence.push(0);
                } else {
                    let next_piece = next_piece + 1;
                    sequence.push(next_piece);
                    *done = next_piece == config.end_piece;
                }
            }

            let n_finished = finished.iter().filter(|&&done| done).count();
            debug!(step, n_finished, batch_size, "Greedy decoding step");

            if n_finished == batch_size {
                break;
            }
        }

        let decoded_len = sequences.first().map(Vec::len).unwrap_or(1);
        Tensor::from_iter(sequences.into_iter().flatten(), device)
            .and_then(|xs| xs.reshape((batch_size, decoded_len)))
            .context(PieceIdsSnafu)
    }
}
