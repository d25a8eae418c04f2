use candle_core::{DType, Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

use crate::util::tensor_ext::MinLike;

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot create mask"))]
    CreateMask { source: candle_core::Error },

    #[snafu(display("Attention mask must be 2D, was {}D", n_dims))]
    InvalidDims { n_dims: usize },
}

/// Attention mask.
///
/// Sequence elements for which the corresponding mask element is set to
/// `false` are ignored during attention calculation. Guaranteed to be
/// a 2D array.
#[derive(Clone, Debug)]
pub struct AttentionMask {
    bool_mask: Tensor,
}

impl AttentionMask {
    /// Create an input attention mask.
    ///
    /// * `bool_mask` - Boolean mask tensor.
    ///   *Shape:* `(batch_size, seq_len)`
    pub fn new(bool_mask: Tensor) -> Result<Self, AttentionMaskError> {
        let n_dims = bool_mask.dims().len();
        ensure!(n_dims == 2, InvalidDimsSnafu { n_dims });
        Ok(AttentionMask { bool_mask })
    }

    /// Create a mask where every sequence element is attended to.
    pub fn all_attended(
        batch_size: usize,
        seq_len: usize,
        device: &Device,
    ) -> Result<Self, AttentionMaskError> {
        Self::new(
            Tensor::ones((batch_size, seq_len), DType::U8, device).context(CreateMaskSnafu)?,
        )
    }

    /// Create a mask that ignores padding pieces.
    ///
    /// The piece identifier `0` is reserved for padding.
    ///
    /// * `piece_ids` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    pub fn padding_mask(piece_ids: &Tensor) -> Result<Self, AttentionMaskError> {
        let bool_mask = piece_ids
            .zeros_like()
            .and_then(|padding| piece_ids.ne(&padding))
            .context(CreateMaskSnafu)?;
        Self::new(bool_mask)
    }

    /// Boolean mask tensor.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }
}

/// Errors for self-attention masks.
#[derive(Debug, Snafu)]
pub enum SelfAttentionMaskError {
    #[snafu(display("Cannot apply logits mask"))]
    ApplyLogitsMask { source: candle_core::Error },

    #[snafu(display("Cannot create look-ahead mask"))]
    CreateLookAheadMask { source: candle_core::Error },

    #[snafu(display("Cannot intersect masks"))]
    IntersectMasks { source: candle_core::Error },

    #[snafu(display("Query length {query_len} must not be larger than key length {key_len}"))]
    QueryLen { key_len: usize, query_len: usize },

    #[snafu(display("Cannot reshape input mask"))]
    Reshape { source: candle_core::Error },
}

/// Attention mask over queries and keys.
///
/// A 4D attention mask with shape *(batch_size, heads, query_len, key_len)*,
/// where the batch, head and query axes may have size 1 to broadcast.
/// Elements for which the corresponding mask element is set to `false` are
/// ignored during attention calculation.
#[derive(Clone, Debug)]
pub struct SelfAttentionMask {
    bool_mask: Tensor,
}

impl TryFrom<&AttentionMask> for SelfAttentionMask {
    type Error = SelfAttentionMaskError;

    fn try_from(attention_mask: &AttentionMask) -> Result<Self, Self::Error> {
        let (batch_len, key_len) = attention_mask.bool_mask.dims2().context(ReshapeSnafu)?;
        Ok(SelfAttentionMask {
            bool_mask: attention_mask
                .bool_mask
                .reshape((batch_len, 1, 1, key_len))
                .context(ReshapeSnafu)?,
        })
    }
}

impl SelfAttentionMask {
    /// Create a look-ahead mask.
    ///
    /// A look-ahead (causal) mask ensures that sequence elements cannot
    /// attend to succeeding elements. When the query is shorter than the
    /// key, the queries are aligned with the last key positions.
    ///
    /// * `query_len` - Query length.
    /// * `key_len` - Key length.
    /// * `device` - Device to create the mask on.
    pub fn look_ahead(
        query_len: usize,
        key_len: usize,
        device: &Device,
    ) -> Result<Self, SelfAttentionMaskError> {
        // Slicing will fail if the query length is greater than the key length.
        ensure!(query_len <= key_len, QueryLenSnafu { key_len, query_len });

        let bool_mask = Tensor::tril2(key_len, DType::U8, device)
            .and_then(|mask| mask.narrow(0, key_len - query_len, query_len))
            .and_then(|mask| mask.reshape((1, 1, query_len, key_len)))
            .context(CreateLookAheadMaskSnafu)?;

        Ok(SelfAttentionMask { bool_mask })
    }

    /// Create the mask for decoder self-attention.
    ///
    /// Combines a look-ahead mask with a mask for padding pieces.
    ///
    /// * `piece_ids` - Decoder piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    pub fn for_decoder(piece_ids: &Tensor) -> Result<Self, SelfAttentionMaskError> {
        let (_, seq_len) = piece_ids.dims2().context(ReshapeSnafu)?;
        let padding_mask = piece_ids
            .zeros_like()
            .and_then(|padding| piece_ids.ne(&padding))
            .context(CreateLookAheadMaskSnafu)?;
        let padding_mask = AttentionMask { bool_mask: padding_mask };
        SelfAttentionMask::try_from(&padding_mask)?.intersect(&Self::look_ahead(
            seq_len,
            seq_len,
            piece_ids.device(),
        )?)
    }

    /// Boolean mask tensor.
    ///
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Use the attention mask to mask logits.
    ///
    /// Masked logits are set to the minimum value of the logits data type,
    /// so that they get a probability of (close to) zero after softmax.
    ///
    /// * input - Tensor to which the mask is applied.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Logits with the attention mask applied.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply_logit_mask(&self, input: &Tensor) -> Result<Tensor, SelfAttentionMaskError> {
        let blocked_value = input.min_like().context(ApplyLogitsMaskSnafu)?;
        self.bool_mask
            .broadcast_as(input.shape())
            .and_then(|xs| xs.where_cond(input, &blocked_value))
            .context(ApplyLogitsMaskSnafu)
    }

    /// Merge this attention mask with another attention mask.
    ///
    /// A sequence element is only attended to when both masks allow it.
    pub fn intersect(
        &self,
        other: &SelfAttentionMask,
    ) -> Result<SelfAttentionMask, SelfAttentionMaskError> {
        Ok(SelfAttentionMask {
            bool_mask: self
                .bool_mask
                .broadcast_mul(&other.bool_mask)
                .context(IntersectMasksSnafu)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use super::{AttentionMask, AttentionMaskError, SelfAttentionMask, SelfAttentionMaskError};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn padding_mask_masks_zero_pieces() -> Result<(), Whatever> {
        for device in test_devices() {
            let piece_ids = Tensor::new(&[[5u32, 7, 0, 0], [1, 2, 3, 0]], &device)
                .whatever_context("Cannot create piece identifiers")?;
            let mask = AttentionMask::padding_mask(&piece_ids)
                .whatever_context("Cannot create padding mask")?;
            assert_tensor_eq!(
                mask.bool_mask()
                    .to_dtype(DType::F32)
                    .whatever_context("Cannot convert mask")?,
                array![[1f32, 1., 0., 0.], [1., 1., 1., 0.]],
            );
        }
        Ok(())
    }

    #[test]
    fn attention_mask_must_be_2d() {
        let mask = Tensor::ones((1, 2, 3), DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            AttentionMask::new(mask),
            Err(AttentionMaskError::InvalidDims { n_dims: 3 })
        ));
    }

    #[test]
    #[report]
    fn look_ahead_mask_is_lower_triangular() -> Result<(), Whatever> {
        let mask = SelfAttentionMask::look_ahead(3, 3, &Device::Cpu)
            .whatever_context("Cannot create look-ahead mask")?;
        assert_tensor_eq!(
            mask.bool_mask()
                .to_dtype(DType::F32)
                .and_then(|xs| xs.squeeze(0))
                .and_then(|xs| xs.squeeze(0))
                .whatever_context("Cannot convert mask")?,
            array![[1f32, 0., 0.], [1., 1., 0.], [1., 1., 1.]],
        );

        // Shorter queries are aligned with the last keys.
        let mask = SelfAttentionMask::look_ahead(2, 4, &Device::Cpu)
            .whatever_context("Cannot create look-ahead mask")?;
        assert_tensor_eq!(
            mask.bool_mask()
                .to_dtype(DType::F32)
                .and_then(|xs| xs.reshape((2, 4)))
                .whatever_context("Cannot convert mask")?,
            array![[1f32, 1., 1., 0.], [1., 1., 1., 1.]],
        );

        Ok(())
    }

    #[test]
    fn look_ahead_mask_rejects_long_queries() {
        assert!(matches!(
            SelfAttentionMask::look_ahead(4, 2, &Device::Cpu),
            Err(SelfAttentionMaskError::QueryLen {
                key_len: 2,
                query_len: 4
            })
        ));
    }

    #[test]
    #[report]
    fn decoder_mask_combines_look_ahead_and_padding() -> Result<(), Whatever> {
        let piece_ids = Tensor::new(&[[4u32, 9, 0]], &Device::Cpu)
            .whatever_context("Cannot create piece identifiers")?;
        let mask = SelfAttentionMask::for_decoder(&piece_ids)
            .whatever_context("Cannot create decoder mask")?;
        assert_tensor_eq!(
            mask.bool_mask()
                .to_dtype(DType::F32)
                .and_then(|xs| xs.reshape((3, 3)))
                .whatever_context("Cannot convert mask")?,
            array![[1f32, 0., 0.], [1., 1., 0.], [1., 1., 0.]],
        );
        Ok(())
    }

    #[test]
    #[report]
    fn logit_mask_blocks_masked_positions() -> Result<(), Whatever> {
        let mask = AttentionMask::new(
            Tensor::new(&[[1u8, 0]], &Device::Cpu).whatever_context("Cannot create mask")?,
        )
        .whatever_context("Cannot create attention mask")?;
        let mask = SelfAttentionMask::try_from(&mask)
            .whatever_context("Cannot create self-attention mask")?;
        let logits = Tensor::new(&[2f32, 3.], &Device::Cpu)
            .and_then(|xs| xs.reshape((1, 1, 1, 2)))
            .whatever_context("Cannot create logits")?;
        let masked = mask
            .apply_logit_mask(&logits)
            .whatever_context("Cannot apply logit mask")?
            .flatten_all()
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot read masked logits")?;
        assert_eq!(masked, vec![2., f32::MIN]);
        Ok(())
    }
}
