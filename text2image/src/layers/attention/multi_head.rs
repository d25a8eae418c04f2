use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionOutput, AttentionScorer, BuildAttentionScorer, ScaledDotProductAttentionConfig,
    SelfAttentionMask,
};
use crate::layers::init::{linear, Initializer};

/// Multi-head attention configuration.
#[derive(Debug)]
pub struct MultiHeadAttentionConfig {
    attention_scorer: Box<dyn BuildAttentionScorer>,
    hidden_width: usize,
    initializer: Initializer,
    n_heads: usize,
    use_bias: bool,
}

impl MultiHeadAttentionConfig {
    /// Attention scorer.
    ///
    /// Default: `ScaledDotProductAttentionConfig::default()`
    pub fn attention_scorer(mut self, attention_scorer: Box<dyn BuildAttentionScorer>) -> Self {
        self.attention_scorer = attention_scorer;
        self
    }

    /// Hidden width, the width of the layer input and output.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Initializer for the projection weights.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Use bias in the projections.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build a multi-head attention layer.
    pub fn build_attention(
        &self,
        vb: VarBuilder,
    ) -> Result<MultiHeadAttention, MultiHeadAttentionError> {
        ensure!(
            self.n_heads > 0 && self.hidden_width % self.n_heads == 0,
            IncorrectNHeadsSnafu {
                hidden_width: self.hidden_width,
                n_heads: self.n_heads,
            }
        );

        let projection = |name: &str| {
            linear(
                self.hidden_width,
                self.hidden_width,
                self.use_bias,
                self.initializer,
                vb.push_prefix(name),
            )
            .context(ConstructionSnafu)
        };

        Ok(MultiHeadAttention {
            attention_scorer: self
                .attention_scorer
                .build(vb.push_prefix("attention_scorer"))
                .context(BuildAttentionScorerSnafu)?,
            key: projection("key")?,
            n_heads: self.n_heads,
            output: projection("output")?,
            query: projection("query")?,
            value: projection("value")?,
        })
    }
}

impl Default for MultiHeadAttentionConfig {
    fn default() -> Self {
        Self {
            attention_scorer: Box::new(ScaledDotProductAttentionConfig::default()),
            hidden_width: 512,
            initializer: Initializer::GlorotUniform,
            n_heads: 8,
            use_bias: true,
        }
    }
}

/// Errors for multi-head attention.
#[derive(Debug, Snafu)]
pub enum MultiHeadAttentionError {
    #[snafu(display("Cannot apply attention scorer"))]
    AttentionScorer { source: BoxedError },

    #[snafu(display("Cannot build attention scorer"))]
    BuildAttentionScorer { source: BoxedError },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Cannot construct layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display(
        "Hidden width ({hidden_width}) must be a multiple of the number of heads ({n_heads})"
    ))]
    IncorrectNHeads { hidden_width: usize, n_heads: usize },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Multi-head attention layer.
///
/// Queries are computed from one input and keys/values from another, so
/// the same layer can be used for self-attention and for attention over
/// the encoder output.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct MultiHeadAttention {
    attention_scorer: Box<dyn AttentionScorer>,
    key: Linear,
    n_heads: usize,
    output: Linear,
    query: Linear,
    value: Linear,
}

impl MultiHeadAttention {
    /// Apply attention.
    ///
    /// * `query_input` - Input to compute the queries from.
    ///   *Shape:* `(batch_size, query_len, width)`
    /// * `key_value_input` - Input to compute the keys and values from.
    ///   *Shape:* `(batch_size, key_len, width)`
    /// * `attention_mask` - Attention mask. Sequence elements for which
    ///   the corresponding mask element is set to `false` are ignored in attention.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: Attention output with *shape:* `(batch_size, query_len, width)`
    /// and attention weights with *shape:* `(batch_size, heads, query_len, key_len)`.
    pub fn forward_t(
        &self,
        query_input: &Tensor,
        key_value_input: &Tensor,
        attention_mask: Option<&SelfAttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, MultiHeadAttentionError> {
        let query = self
            .query
            .forward(query_input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let key = self
            .key
            .forward(key_value_input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let value = self
            .value
            .forward(key_value_input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;

        let AttentionOutput { output, weights } = self
            .attention_scorer
            .forward(&query, &key, &value, attention_mask, train)
            .context(AttentionScorerSnafu)?;

        let output = self
            .output
            .forward(&output.combine_heads()?)
            .context(OutputSnafu)?;

        Ok(AttentionOutput { output, weights })
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, seq_len, model_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = model_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .and_then(|heads| heads.contiguous())
            .context(SplitHeadsSnafu)
    }
}
