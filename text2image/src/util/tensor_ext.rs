/// Tensor extension traits.
use candle_core::{DType, Tensor};
use half::{bf16, f16};

/// Get a tensor filled with the data type's minimum value.
pub trait MinLike: Sized {
    /// Get a new tensor with the data type's minimum value.
    ///
    /// The tensor has the same shape and device as `self`.
    fn min_like(&self) -> Result<Self, candle_core::Error>;
}

impl MinLike for Tensor {
    fn min_like(&self) -> Result<Self, candle_core::Error> {
        match self.dtype() {
            DType::BF16 => Tensor::try_from(bf16::MIN),
            DType::F16 => Tensor::try_from(f16::MIN),
            DType::F32 => Tensor::try_from(f32::MIN),
            DType::F64 => Tensor::try_from(f64::MIN),
            DType::U8 => Tensor::try_from(u8::MIN),
            DType::U32 => Tensor::try_from(u32::MIN),
            DType::I64 => Tensor::try_from(i64::MIN),
        }
        .and_then(|scalar| scalar.to_device(self.device()))
        .and_then(|scalar| scalar.broadcast_as(self.shape()))
    }
}

/// Masked averaging over a sequence axis.
pub trait MaskedMean: Sized {
    /// Average over axis 1, only counting positions where `mask` is set.
    ///
    /// * `mask` - Mask with `1` for positions to include.
    ///   *Shape:* `(batch_size, seq_len)`
    ///
    /// Rows without any included position average to zero.
    ///
    /// Returns: *Shape:* `(batch_size, width)` for input with shape
    /// `(batch_size, seq_len, width)`.
    fn masked_mean(&self, mask: &Tensor) -> Result<Self, candle_core::Error>;
}

impl MaskedMean for Tensor {
    fn masked_mean(&self, mask: &Tensor) -> Result<Self, candle_core::Error> {
        let mask = mask.to_dtype(self.dtype())?.unsqueeze(2)?;
        let summed = self.broadcast_mul(&mask)?.sum(1)?;
        // max(count, 1) without creating a scalar on the host device.
        let count = mask.sum(1)?.affine(1., -1.)?.relu()?.affine(1., 1.)?;
        summed.broadcast_div(&count)
    }
}
