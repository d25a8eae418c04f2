use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::embeddings::{SinusoidalPositions2D, SinusoidalPositionsError};
use crate::layers::init::{linear, Initializer};

/// Configuration for embeddings of continuous input features.
#[derive(Debug)]
pub struct FeatureEmbeddingsConfig {
    dropout: Box<dyn BuildModule>,
    grid_positions: Option<(usize, usize)>,
    hidden_width: usize,
    initializer: Initializer,
    input_width: usize,
}

impl FeatureEmbeddingsConfig {
    /// Dropout applied to the embeddings.
    ///
    /// Default: `DropoutConfig::default()`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Add 2D sinusoidal positions for a `(rows, cols)` feature grid.
    ///
    /// Default: `None`
    pub fn grid_positions(mut self, grid_positions: Option<(usize, usize)>) -> Self {
        self.grid_positions = grid_positions;
        self
    }

    /// Width of the embeddings.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Initializer of the projection.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Width of the input features.
    ///
    /// Default: `2048`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Build the feature embeddings.
    pub fn build_embeddings(
        &self,
        vb: VarBuilder,
    ) -> Result<FeatureEmbeddings, FeatureEmbeddingsError> {
        let positions = self
            .grid_positions
            .map(|(rows, cols)| {
                SinusoidalPositions2D::new(rows, cols, self.hidden_width, vb.device())
            })
            .transpose()
            .context(PositionsSnafu)?;

        Ok(FeatureEmbeddings {
            dropout: self
                .dropout
                .build(vb.push_prefix("dropout"))
                .context(BuildDropoutSnafu)?,
            positions,
            projection: linear(
                self.input_width,
                self.hidden_width,
                true,
                self.initializer,
                vb.push_prefix("projection"),
            )
            .context(ConstructionSnafu)?,
        })
    }

    /// Width of the input features.
    pub fn get_input_width(&self) -> usize {
        self.input_width
    }
}

impl Default for FeatureEmbeddingsConfig {
    fn default() -> Self {
        Self {
            dropout: Box::new(DropoutConfig::default()),
            grid_positions: None,
            hidden_width: 512,
            initializer: Initializer::GlorotUniform,
            input_width: 2048,
        }
    }
}

/// Errors for feature embeddings.
#[derive(Debug, Snafu)]
pub enum FeatureEmbeddingsError {
    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot construct feature projection"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot add grid positions"))]
    AddPositions { source: candle_core::Error },

    #[snafu(display("Cannot get grid positions"))]
    Positions { source: SinusoidalPositionsError },

    #[snafu(display("Cannot project input features"))]
    Projection { source: candle_core::Error },
}

/// Embeddings of continuous input features.
///
/// Features are projected to the hidden width with a ReLU-activated
/// affine transformation. 2D grid positions can optionally be added.
pub struct FeatureEmbeddings {
    dropout: Box<dyn ModuleT>,
    positions: Option<SinusoidalPositions2D>,
    projection: Linear,
}

impl FeatureEmbeddings {
    /// Embed input features.
    ///
    /// * `features` - Input features.
    ///   *Shape:* `(batch_size, seq_len, input_width)`
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: *Shape:* `(batch_size, seq_len, hidden_width)`
    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<Tensor, FeatureEmbeddingsError> {
        let mut embeddings = self
            .projection
            .forward(features)
            .and_then(|xs| xs.relu())
            .context(ProjectionSnafu)?;

        if let Some(positions) = &self.positions {
            let seq_len = embeddings.dim(1).context(AddPositionsSnafu)?;
            let positions = positions.forward(seq_len).context(PositionsSnafu)?;
            embeddings = positions
                .to_dtype(embeddings.dtype())
                .and_then(|positions| embeddings.broadcast_add(&positions))
                .context(AddPositionsSnafu)?;
        }

        self.dropout
            .forward_t(&embeddings, train)
            .context(DropoutSnafu)
    }
}
