/// Transformer architecture implementations.
pub(crate) mod decoder;
pub use decoder::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderError};

pub(crate) mod encoder;
pub use encoder::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderError};

mod generate;
pub use generate::{GreedyDecode, GreedyDecodeConfig, GreedyDecodeError};

pub(crate) mod model;
pub use model::{Transformer, TransformerConfig, TransformerError};
