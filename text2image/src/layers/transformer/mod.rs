/// Transformer building blocks.
mod feature_embeddings;
pub use feature_embeddings::{FeatureEmbeddings, FeatureEmbeddingsConfig, FeatureEmbeddingsError};

mod piece_embeddings;
pub use piece_embeddings::{PieceEmbeddings, PieceEmbeddingsConfig, PieceEmbeddingsError};

mod layer;
pub use layer::{
    DecoderLayer, DecoderLayerOutput, EncoderLayer, TransformerLayerConfig, TransformerLayerError,
};
