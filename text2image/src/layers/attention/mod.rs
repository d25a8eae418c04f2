use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

mod mask;
pub use mask::{AttentionMask, AttentionMaskError, SelfAttentionMask, SelfAttentionMaskError};

mod multi_head;
pub use multi_head::{MultiHeadAttention, MultiHeadAttentionConfig, MultiHeadAttentionError};

mod sdpa;
pub use sdpa::{
    ScaledDotProductAttention, ScaledDotProductAttentionConfig, ScaledDotProductAttentionError,
};

use crate::error::BoxedError;

/// Output of an attention layer.
#[derive(Clone, Debug)]
pub struct AttentionOutput {
    /// Attention values.
    pub output: Tensor,

    /// Attention probabilities.
    ///
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub weights: Tensor,
}

/// Trait implemented by modules that perform attention scoring.
pub trait AttentionScorer {
    /// Apply attention scores to the given key, query and value.
    /// Sequence elements that are marked with `false` in the attention mask
    /// are ignored by the attention mechanism (if a mask is provided).
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `value` - Value tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `attention_mask` - Attention mask. Sequence elements for which
    ///   the corresponding mask element is set to `false` are ignored in attention.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: Attention values with *shape:*
    /// `(batch_size, heads, query_len, width)` and the attention weights.
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&SelfAttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, BoxedError>;
}

/// Build an attention scorer module.
pub trait BuildAttentionScorer: Debug {
    /// Build an attention scorer.
    ///
    /// * `vb` - Variable builder used for attention parameters.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn AttentionScorer>, BoxedError>;
}
