use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;

/// Trait for building image generators.
pub trait BuildGenerator: Debug {
    /// Generator type.
    type Generator: Generator;

    /// Build a generator.
    fn build(&self, vb: VarBuilder) -> Result<Self::Generator, BoxedError>;
}

impl<G> BuildGenerator for G
where
    G: BuildArchitecture + Debug,
    G::Architecture: Generator,
{
    type Generator = G::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Generator, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// Trait for generators that render images conditioned on text.
pub trait Generator {
    /// Render images.
    ///
    /// * `noise` - Noise vectors.
    ///   *Shape:* `(batch_size, noise_width)`
    /// * `text_embedding` - Text embeddings to condition on.
    ///   *Shape:* `(batch_size, text_width)`
    /// * `train` - Whether to train the generator.
    ///
    /// Returns: images with values in `[-1, 1]`.
    /// *Shape:* `(batch_size, channels, height, width)`
    fn forward_t(
        &self,
        noise: &Tensor,
        text_embedding: &Tensor,
        train: bool,
    ) -> Result<Tensor, BoxedError>;

    /// Width of the noise vectors.
    fn noise_width(&self) -> usize;

    /// Width of the text embeddings.
    fn text_width(&self) -> usize;
}
