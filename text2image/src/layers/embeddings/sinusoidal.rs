use candle_core::{Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for sinusoidal position encodings.
#[derive(Debug, Snafu)]
pub enum SinusoidalPositionsError {
    #[snafu(display("Cannot create position table"))]
    CreateTable { source: candle_core::Error },

    #[snafu(display("Sequence length {seq_len} exceeds the number of positions {n_positions}"))]
    SeqTooLong { n_positions: usize, seq_len: usize },

    #[snafu(display("Cannot slice position table"))]
    SliceTable { source: candle_core::Error },

    #[snafu(display("Width of 2D positions must be even, was {width}"))]
    WidthNotEven { width: usize },
}

/// Fill a `(n_positions, width)` table with sinusoidal encodings.
///
/// The angle of position `pos` at index `i` is
/// `pos / 10000^(2⌊i/2⌋ / width)`. Even indices get the sine of the angle,
/// odd indices the cosine.
fn sinusoidal_table(positions: impl Iterator<Item = usize>, width: usize) -> Vec<f32> {
    positions
        .flat_map(|pos| {
            (0..width).map(move |i| {
                let exponent = (2 * (i / 2)) as f64 / width as f64;
                let angle = pos as f64 / 10_000f64.powf(exponent);
                if i % 2 == 0 {
                    angle.sin() as f32
                } else {
                    angle.cos() as f32
                }
            })
        })
        .collect()
}

fn slice_positions(
    table: &Tensor,
    n_positions: usize,
    seq_len: usize,
) -> Result<Tensor, SinusoidalPositionsError> {
    ensure!(
        seq_len <= n_positions,
        SeqTooLongSnafu {
            n_positions,
            seq_len
        }
    );
    table.narrow(1, 0, seq_len).context(SliceTableSnafu)
}

/// Sinusoidal position encodings (Vaswani et al., 2017).
///
/// Encodings are precomputed for `n_positions` positions.
///
/// Paper: https://arxiv.org/abs/1706.03762
#[derive(Clone, Debug)]
pub struct SinusoidalPositions {
    n_positions: usize,
    table: Tensor,
}

impl SinusoidalPositions {
    /// Construct the position encodings.
    ///
    /// * `n_positions` - Number of positions to precompute.
    /// * `width` - Encoding width.
    /// * `device` - Device on which the table is allocated.
    pub fn new(
        n_positions: usize,
        width: usize,
        device: &Device,
    ) -> Result<Self, SinusoidalPositionsError> {
        let table = Tensor::from_vec(
            sinusoidal_table(0..n_positions, width),
            (1, n_positions, width),
            device,
        )
        .context(CreateTableSnafu)?;
        Ok(SinusoidalPositions { n_positions, table })
    }

    /// Get the encodings of the first `seq_len` positions.
    ///
    /// Returns: *Shape:* `(1, seq_len, width)`, always `F32`.
    pub fn forward(&self, seq_len: usize) -> Result<Tensor, SinusoidalPositionsError> {
        slice_positions(&self.table, self.n_positions, seq_len)
    }

    /// Number of precomputed positions.
    pub fn n_positions(&self) -> usize {
        self.n_positions
    }
}

/// Sinusoidal position encodings for a 2D grid.
///
/// The first half of the encoding encodes the row, the second half the
/// column. Each half uses the 1D encoding with half the width. Grid cells
/// are flattened in row-major order.
#[derive(Clone, Debug)]
pub struct SinusoidalPositions2D {
    n_positions: usize,
    table: Tensor,
}

impl SinusoidalPositions2D {
    /// Construct the position encodings.
    ///
    /// * `rows` - Number of grid rows.
    /// * `cols` - Number of grid columns.
    /// * `width` - Encoding width. Must be even.
    /// * `device` - Device on which the table is allocated.
    pub fn new(
        rows: usize,
        cols: usize,
        width: usize,
        device: &Device,
    ) -> Result<Self, SinusoidalPositionsError> {
        ensure!(width % 2 == 0, WidthNotEvenSnafu { width });
        let half_width = width / 2;
        let n_positions = rows * cols;

        let row_table = sinusoidal_table((0..n_positions).map(|pos| pos / cols), half_width);
        let col_table = sinusoidal_table((0..n_positions).map(|pos| pos % cols), half_width);

        let table = row_table
            .chunks(half_width.max(1))
            .zip(col_table.chunks(half_width.max(1)))
            .flat_map(|(row, col)| row.iter().chain(col).copied())
            .collect::<Vec<_>>();

        let table = Tensor::from_vec(table, (1, n_positions, width), device)
            .context(CreateTableSnafu)?;

        Ok(SinusoidalPositions2D { n_positions, table })
    }

    /// Get the encodings of the first `seq_len` grid cells.
    ///
    /// Returns: *Shape:* `(1, seq_len, width)`, always `F32`.
    pub fn forward(&self, seq_len: usize) -> Result<Tensor, SinusoidalPositionsError> {
        slice_positions(&self.table, self.n_positions, seq_len)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, IndexOp};
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use super::{SinusoidalPositions, SinusoidalPositions2D, SinusoidalPositionsError};
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn sinusoidal_positions_values() -> Result<(), Whatever> {
        let positions = SinusoidalPositions::new(50, 4, &Device::Cpu)
            .whatever_context("Cannot create positions")?;
        let encodings = positions
            .forward(3)
            .whatever_context("Cannot get encodings")?;
        assert_eq!(encodings.dims(), &[1, 3, 4]);

        let (sin1, cos1) = (1f32.sin(), 1f32.cos());
        let (sin2, cos2) = (2f32.sin(), 2f32.cos());
        let (sin_01, cos_01) = (0.01f32.sin(), 0.01f32.cos());
        let (sin_02, cos_02) = (0.02f32.sin(), 0.02f32.cos());
        assert_tensor_eq!(
            encodings.i(0).whatever_context("Cannot index encodings")?,
            array![
                [0f32, 1., 0., 1.],
                [sin1, cos1, sin_01, cos_01],
                [sin2, cos2, sin_02, cos_02]
            ],
            epsilon = 1e-6,
        );

        Ok(())
    }

    #[test]
    fn sinusoidal_positions_reject_long_sequences() {
        let positions = SinusoidalPositions::new(5, 4, &Device::Cpu).unwrap();
        assert!(matches!(
            positions.forward(6),
            Err(SinusoidalPositionsError::SeqTooLong {
                n_positions: 5,
                seq_len: 6
            })
        ));
    }

    #[test]
    #[report]
    fn sinusoidal_positions_2d_encode_row_and_column() -> Result<(), Whatever> {
        let positions = SinusoidalPositions2D::new(2, 3, 4, &Device::Cpu)
            .whatever_context("Cannot create positions")?;
        let encodings = positions
            .forward(6)
            .and_then(|xs| xs.i(0).context(super::SliceTableSnafu))
            .whatever_context("Cannot get encodings")?;

        let (sin1, cos1) = (1f32.sin(), 1f32.cos());
        let (sin2, cos2) = (2f32.sin(), 2f32.cos());
        assert_tensor_eq!(
            encodings,
            array![
                [0f32, 1., 0., 1.],
                [0., 1., sin1, cos1],
                [0., 1., sin2, cos2],
                [sin1, cos1, 0., 1.],
                [sin1, cos1, sin1, cos1],
                [sin1, cos1, sin2, cos2]
            ],
            epsilon = 1e-6,
        );

        Ok(())
    }

    #[test]
    fn sinusoidal_positions_2d_require_even_width() {
        assert!(matches!(
            SinusoidalPositions2D::new(8, 8, 5, &Device::Cpu),
            Err(SinusoidalPositionsError::WidthNotEven { width: 5 })
        ));
    }
}
