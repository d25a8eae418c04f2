use candle_core::{DType, Device, Shape, Tensor};
use rand_core::RngCore;
use rand_pcg::Pcg32;

/// Seeded sampling of tensors.
///
/// Sampling uses a PCG generator directly, so that the same seed gives
/// the same tensor regardless of the device or backend.
pub trait SeededUniform: Sized {
    /// Sample a tensor uniformly from `[lo, up)`.
    ///
    /// * `shape` - Shape of the tensor.
    /// * `lo` - Lower bound (inclusive).
    /// * `up` - Upper bound (exclusive).
    /// * `seed` - Seed of the generator.
    /// * `dtype` - Data type of the returned tensor.
    /// * `device` - Device to allocate the tensor on.
    fn seeded_uniform(
        shape: impl Into<Shape>,
        lo: f32,
        up: f32,
        seed: u64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, candle_core::Error>;
}

impl SeededUniform for Tensor {
    fn seeded_uniform(
        shape: impl Into<Shape>,
        lo: f32,
        up: f32,
        seed: u64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, candle_core::Error> {
        let shape = shape.into();
        let mut rng = Pcg32::new(seed, 0);
        let mantissa_bits_shift = u32::BITS - f32::MANTISSA_DIGITS;
        let data = (0..shape.elem_count())
            .map(|_| {
                // Use the upper bits to get a uniform number in [0, 1).
                let zero_one = (rng.next_u32() >> mantissa_bits_shift) as f32
                    / (1u32 << f32::MANTISSA_DIGITS) as f32;
                lo + zero_one * (up - lo)
            })
            .collect::<Vec<_>>();
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::SeededUniform;

    #[test]
    #[report]
    fn seeded_uniform_is_reproducible_and_bounded() -> Result<(), Whatever> {
        let sample = |seed| {
            Tensor::seeded_uniform((4, 25), -1., 1., seed, DType::F32, &Device::Cpu)
                .and_then(|xs| xs.flatten_all())
                .and_then(|xs| xs.to_vec1::<f32>())
        };

        let first = sample(42).whatever_context("Cannot sample tensor")?;
        let second = sample(42).whatever_context("Cannot sample tensor")?;
        let other = sample(7).whatever_context("Cannot sample tensor")?;

        assert_eq!(first.len(), 100);
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.iter().all(|&v| (-1. ..1.).contains(&v)));

        Ok(())
    }
}
