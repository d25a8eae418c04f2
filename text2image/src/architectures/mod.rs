/// Traits for model architectures.
use candle_nn::VarBuilder;

mod decoder;
pub use decoder::{BuildDecoder, Decoder, DecoderAttentionWeights, DecoderOutput};

mod encoder;
pub use encoder::{BuildEncoder, Encoder, EncoderOutput};

mod generator;
pub use generator::{BuildGenerator, Generator};

mod output;
pub use output::LayerOutputs;

mod seq2seq;
pub use seq2seq::{
    BuildSeq2Seq, Seq2Seq, Seq2SeqDecodeOutput, Seq2SeqError, Seq2SeqMasks, Seq2SeqMasksError,
    Seq2SeqOutput,
};

use crate::error::BoxedError;

/// Trait for building model architectures.
pub trait BuildArchitecture {
    /// The architecture to build.
    type Architecture;

    /// Build the architecture.
    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError>;
}
