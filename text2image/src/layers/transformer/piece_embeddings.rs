use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Embedding, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::embeddings::{SinusoidalPositions, SinusoidalPositionsError};
use crate::layers::init::{embedding, Initializer};

/// Configuration for piece embeddings.
#[derive(Debug)]
pub struct PieceEmbeddingsConfig {
    dropout: Box<dyn BuildModule>,
    hidden_width: usize,
    initializer: Initializer,
    n_pieces: usize,
    n_positions: usize,
}

impl PieceEmbeddingsConfig {
    /// Dropout applied to the embeddings.
    ///
    /// Default: `DropoutConfig::default()`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the embeddings.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Initializer of the embedding table.
    ///
    /// Default: `Initializer::Uniform { lo: -0.05, up: 0.05 }`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Number of pieces in the vocabulary.
    ///
    /// Default: `5001`
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }

    /// Number of positions with a sinusoidal encoding.
    ///
    /// Default: `5001`
    pub fn n_positions(mut self, n_positions: usize) -> Self {
        self.n_positions = n_positions;
        self
    }

    /// Build the piece embeddings.
    pub fn build_embeddings(&self, vb: VarBuilder) -> Result<PieceEmbeddings, PieceEmbeddingsError> {
        Ok(PieceEmbeddings {
            dropout: self
                .dropout
                .build(vb.push_prefix("dropout"))
                .context(BuildDropoutSnafu)?,
            hidden_width: self.hidden_width,
            piece_embeddings: embedding(
                self.n_pieces,
                self.hidden_width,
                self.initializer,
                vb.push_prefix("piece_embeddings"),
            )
            .context(ConstructionSnafu)?,
            positions: SinusoidalPositions::new(self.n_positions, self.hidden_width, vb.device())
                .context(PositionsSnafu)?,
        })
    }
}

impl Default for PieceEmbeddingsConfig {
    fn default() -> Self {
        Self {
            dropout: Box::new(DropoutConfig::default()),
            hidden_width: 512,
            initializer: Initializer::Uniform {
                lo: -0.05,
                up: 0.05,
            },
            n_pieces: 5001,
            n_positions: 5001,
        }
    }
}

/// Errors for piece embeddings.
#[derive(Debug, Snafu)]
pub enum PieceEmbeddingsError {
    #[snafu(display("Cannot add positions"))]
    AddPositions { source: candle_core::Error },

    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot construct embedding table"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot look up piece embeddings"))]
    Lookup { source: candle_core::Error },

    #[snafu(display("Cannot get positions"))]
    Positions { source: SinusoidalPositionsError },
}

/// Piece embeddings.
///
/// Embeddings are scaled by the square root of the hidden width and
/// sinusoidal positions are added.
pub struct PieceEmbeddings {
    dropout: Box<dyn ModuleT>,
    hidden_width: usize,
    piece_embeddings: Embedding,
    positions: SinusoidalPositions,
}

impl PieceEmbeddings {
    /// Embed pieces.
    ///
    /// * `piece_ids` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: *Shape:* `(batch_size, seq_len, hidden_width)`
    pub fn forward_t(&self, piece_ids: &Tensor, train: bool) -> Result<Tensor, PieceEmbeddingsError> {
        let (_, seq_len) = piece_ids.dims2().context(LookupSnafu)?;
        let embeddings = self
            .piece_embeddings
            .forward(piece_ids)
            .and_then(|xs| xs.affine((self.hidden_width as f64).sqrt(), 0.))
            .context(LookupSnafu)?;

        let positions = self.positions.forward(seq_len).context(PositionsSnafu)?;
        let embeddings = positions
            .to_dtype(embeddings.dtype())
            .and_then(|positions| embeddings.broadcast_add(&positions))
            .context(AddPositionsSnafu)?;

        self.dropout
            .forward_t(&embeddings, train)
            .context(DropoutSnafu)
    }

    /// Number of positions that can be embedded.
    pub fn n_positions(&self) -> usize {
        self.positions.n_positions()
    }
}
