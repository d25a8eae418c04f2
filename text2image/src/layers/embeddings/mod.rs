/// Embedding layers.
mod sinusoidal;
pub use sinusoidal::{SinusoidalPositions, SinusoidalPositions2D, SinusoidalPositionsError};
