//! On-disk network configuration.
use candle_core::DType;
use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::MultiHeadAttentionConfig;
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::norm::LayerNormConfig;
use crate::layers::transformer::{
    FeatureEmbeddingsConfig, PieceEmbeddingsConfig, TransformerLayerConfig,
};
use crate::models::generator::TextToImageConfig;
use crate::models::network::NetworkConfig;
use crate::models::transformer::{
    TransformerConfig, TransformerDecoderConfig, TransformerEncoderConfig,
};

/// Data type of the model parameters.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelDType {
    BFloat16,
    Float16,
    #[default]
    Float32,
}

impl From<ModelDType> for DType {
    fn from(dtype: ModelDType) -> Self {
        match dtype {
            ModelDType::BFloat16 => DType::BF16,
            ModelDType::Float16 => DType::F16,
            ModelDType::Float32 => DType::F32,
        }
    }
}

/// Network configuration errors.
#[derive(Debug, Snafu)]
pub enum NetworkConfigError {
    #[snafu(display("Dropout probability must be in [0, 1), was {dropout_rate}"))]
    DropoutRate { dropout_rate: f32 },

    #[snafu(display(
        "Hidden width ({hidden_width}) must be a multiple of the number of heads ({n_heads})"
    ))]
    HiddenWidth { hidden_width: usize, n_heads: usize },

    #[snafu(display("Width must be even to add grid positions, was {hidden_width}"))]
    GridPositionsWidth { hidden_width: usize },
}

/// Network configuration, as stored in `config.json`.
///
/// Missing fields get their default value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct NetworkConfigFile {
    /// Number of columns in the grid of encoder input features.
    pub col_size: usize,

    /// Dropout probability of the transformer.
    pub dropout_rate: f32,

    /// Data type of the parameters.
    pub dtype: ModelDType,

    /// Width of the encoder input features.
    pub feature_width: usize,

    /// Add 2D positional encodings to the encoder input features.
    pub grid_positions: bool,

    /// Hidden width of the transformer.
    pub hidden_width: usize,

    /// Intermediate width of the feed-forward layers.
    pub intermediate_width: usize,

    /// Epsilon of layer normalization.
    pub layer_norm_eps: f64,

    /// Number of attention heads.
    pub n_heads: usize,

    /// Number of encoder and decoder layers.
    pub n_layers: usize,

    /// Number of pieces in the output vocabulary.
    pub n_pieces: usize,

    /// Maximum number of decoded pieces.
    pub n_positions: usize,

    /// Number of residual blocks in the image generator.
    pub n_residual_blocks: usize,

    /// Width of the generator noise.
    pub noise_width: usize,

    /// Number of rows in the grid of encoder input features.
    pub row_size: usize,

    /// Width of the text embedding that conditions the generator.
    pub text_width: usize,

    /// Upsampling layers of the generator as `(channels, stride)` pairs.
    pub upsample_layers: Vec<(usize, usize)>,
}

impl Default for NetworkConfigFile {
    fn default() -> Self {
        Self {
            col_size: 8,
            dropout_rate: 0.1,
            dtype: ModelDType::Float32,
            feature_width: 2048,
            grid_positions: false,
            hidden_width: 512,
            intermediate_width: 2048,
            layer_norm_eps: 1e-6,
            n_heads: 8,
            n_layers: 4,
            n_pieces: 5001,
            n_positions: 5001,
            n_residual_blocks: 4,
            noise_width: 100,
            row_size: 8,
            text_width: 300,
            upsample_layers: vec![(512, 2), (256, 2), (128, 2), (64, 1)],
        }
    }
}

impl NetworkConfigFile {
    /// Data type of the parameters.
    pub fn dtype(&self) -> DType {
        self.dtype.into()
    }

    fn validate(&self) -> Result<(), NetworkConfigError> {
        ensure!(
            (0.0..1.0).contains(&self.dropout_rate),
            DropoutRateSnafu {
                dropout_rate: self.dropout_rate
            }
        );
        ensure!(
            self.n_heads > 0 && self.hidden_width % self.n_heads == 0,
            HiddenWidthSnafu {
                hidden_width: self.hidden_width,
                n_heads: self.n_heads
            }
        );
        ensure!(
            !self.grid_positions || self.hidden_width % 2 == 0,
            GridPositionsWidthSnafu {
                hidden_width: self.hidden_width
            }
        );
        Ok(())
    }
}

impl TryFrom<NetworkConfigFile> for NetworkConfig {
    type Error = BoxedError;

    fn try_from(config: NetworkConfigFile) -> Result<Self, Self::Error> {
        config.validate()?;

        let dropout = Box::new(DropoutConfig::default().p(config.dropout_rate));
        let layer_norm = Box::new(
            LayerNormConfig::default()
                .eps(config.layer_norm_eps)
                .size(config.hidden_width),
        );

        let layer = || {
            TransformerLayerConfig::default()
                .attention(
                    MultiHeadAttentionConfig::default()
                        .hidden_width(config.hidden_width)
                        .n_heads(config.n_heads),
                )
                .dropout(dropout.clone())
                .feedforward(
                    PointwiseFeedForwardConfig::default()
                        .hidden_width(config.hidden_width)
                        .intermediate_width(config.intermediate_width),
                )
                .layer_norm(layer_norm.clone())
        };

        let encoder = TransformerEncoderConfig::default()
            .embeddings(
                FeatureEmbeddingsConfig::default()
                    .dropout(dropout.clone())
                    .grid_positions(
                        config
                            .grid_positions
                            .then_some((config.row_size, config.col_size)),
                    )
                    .hidden_width(config.hidden_width)
                    .input_width(config.feature_width),
            )
            .layer(layer())
            .n_hidden_layers(config.n_layers);

        let decoder = TransformerDecoderConfig::default()
            .embeddings(
                PieceEmbeddingsConfig::default()
                    .dropout(dropout.clone())
                    .hidden_width(config.hidden_width)
                    .n_pieces(config.n_pieces)
                    .n_positions(config.n_positions),
            )
            .layer(layer())
            .n_hidden_layers(config.n_layers);

        let transformer = TransformerConfig::default()
            .decoder(Box::new(decoder))
            .encoder(Box::new(encoder))
            .hidden_width(config.hidden_width)
            .n_pieces(config.n_pieces);

        let generator = TextToImageConfig::default()
            .n_residual_blocks(config.n_residual_blocks)
            .noise_width(config.noise_width)
            .text_width(config.text_width)
            .upsample_layers(config.upsample_layers);

        Ok(NetworkConfig::default()
            .generator(Box::new(generator))
            .hidden_width(config.hidden_width)
            .transformer(Box::new(transformer)))
    }
}
