/// Captioning transformer combined with a text-to-image generator.
use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::architectures::{
    BuildArchitecture, BuildGenerator, BuildSeq2Seq, Generator, LayerOutputs, Seq2Seq,
    Seq2SeqMasks, Seq2SeqMasksError, Seq2SeqOutput,
};
use crate::error::BoxedError;
use crate::layers::attention::{AttentionMask, AttentionMaskError};
use crate::layers::init::{linear, Initializer};
use crate::models::generator::{TextToImage, TextToImageConfig, TextToImageError};
use crate::models::transformer::{
    GreedyDecode, GreedyDecodeConfig, GreedyDecodeError, Transformer, TransformerConfig,
};
use crate::util::tensor_ext::MaskedMean;

/// Network configuration.
#[derive(Debug)]
pub struct NetworkConfig {
    generator: Box<dyn BuildGenerator<Generator = TextToImage>>,
    hidden_width: usize,
    initializer: Initializer,
    transformer: Box<dyn BuildSeq2Seq<Seq2Seq = Transformer>>,
}

impl NetworkConfig {
    /// Image generator.
    ///
    /// Default: `TextToImageConfig::default()`
    pub fn generator(mut self, generator: Box<dyn BuildGenerator<Generator = TextToImage>>) -> Self {
        self.generator = generator;
        self
    }

    /// Hidden width of the transformer decoder.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Initializer of the text projection.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Captioning transformer.
    ///
    /// Default: `TransformerConfig::default()`
    pub fn transformer(mut self, transformer: Box<dyn BuildSeq2Seq<Seq2Seq = Transformer>>) -> Self {
        self.transformer = transformer;
        self
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            generator: Box::<TextToImageConfig>::default(),
            hidden_width: 512,
            initializer: Initializer::GlorotUniform,
            transformer: Box::<TransformerConfig>::default(),
        }
    }
}

impl BuildArchitecture for NetworkConfig {
    type Architecture = Network;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let transformer = self
            .transformer
            .build(vb.push_prefix("transformer"))
            .context(BuildTransformerSnafu)?;
        let generator = self
            .generator
            .build(vb.push_prefix("generator"))
            .context(BuildGeneratorSnafu)?;
        let text_projection = linear(
            self.hidden_width,
            generator.text_width(),
            true,
            self.initializer,
            vb.push_prefix("text_projection"),
        )
        .context(BuildTextProjectionSnafu)?;

        debug!(
            hidden_width = self.hidden_width,
            text_width = generator.text_width(),
            noise_width = generator.noise_width(),
            "Built network"
        );

        Ok(Network {
            generator,
            text_projection,
            transformer,
        })
    }
}

/// Network errors.
#[derive(Debug, Snafu)]
pub enum NetworkError {
    #[snafu(display("Cannot build image generator"))]
    BuildGenerator { source: BoxedError },

    #[snafu(display("Cannot build text projection"))]
    BuildTextProjection { source: candle_core::Error },

    #[snafu(display("Cannot build transformer"))]
    BuildTransformer { source: BoxedError },

    #[snafu(display("Cannot decode captions"))]
    Caption { source: GreedyDecodeError },

    #[snafu(display("Cannot create attention masks"))]
    Masks { source: Seq2SeqMasksError },

    #[snafu(display("Nothing to pool, the decoder does not have any layer outputs"))]
    NoDecoderOutput,

    #[snafu(display("Cannot create padding mask"))]
    PaddingMask { source: AttentionMaskError },

    #[snafu(display("Cannot compute text embedding"))]
    TextEmbedding { source: candle_core::Error },

    #[snafu(display("Cannot render images"))]
    Render { source: TextToImageError },

    #[snafu(display("Cannot apply transformer"))]
    Transformer { source: BoxedError },
}

/// Output of a network pass with known target pieces.
pub struct NetworkOutput {
    images: Tensor,
    seq2seq_output: Seq2SeqOutput,
    text_embedding: Tensor,
}

impl NetworkOutput {
    /// Rendered images.
    ///
    /// *Shape:* `(batch_size, channels, height, width)`
    pub fn images(&self) -> &Tensor {
        &self.images
    }

    /// Output of the transformer.
    pub fn seq2seq_output(&self) -> &Seq2SeqOutput {
        &self.seq2seq_output
    }

    /// Text embedding that conditioned the generator.
    ///
    /// *Shape:* `(batch_size, text_width)`
    pub fn text_embedding(&self) -> &Tensor {
        &self.text_embedding
    }
}

/// Generated captions and images.
pub struct Generation {
    captions: Tensor,
    images: Tensor,
}

impl Generation {
    /// Caption pieces, starting with the start piece and padded with `0`.
    ///
    /// *Shape:* `(batch_size, caption_len)`
    pub fn captions(&self) -> &Tensor {
        &self.captions
    }

    /// Images rendered from the captions.
    ///
    /// *Shape:* `(batch_size, channels, height, width)`
    pub fn images(&self) -> &Tensor {
        &self.images
    }

    /// Split into the captions and images.
    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.captions, self.images)
    }
}

/// Captioning transformer combined with a text-to-image generator.
///
/// The transformer describes the encoder input features with pieces. The
/// last decoder layer is averaged over the non-padding pieces and projected
/// to a text embedding, which conditions the image generator.
pub struct Network {
    generator: TextToImage,
    text_projection: Linear,
    transformer: Transformer,
}

impl Network {
    /// Image generator.
    pub fn generator(&self) -> &TextToImage {
        &self.generator
    }

    /// Captioning transformer.
    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    /// Embed decoded pieces as a text embedding.
    ///
    /// * `decoder_output` - Output of the last decoder layer.
    ///   *Shape:* `(batch_size, target_len, hidden_width)`
    /// * `piece_ids` - Decoded pieces, `0` is padding.
    ///   *Shape:* `(batch_size, target_len)`
    ///
    /// Returns: *Shape:* `(batch_size, text_width)`
    pub fn text_embedding(
        &self,
        decoder_output: &Tensor,
        piece_ids: &Tensor,
    ) -> Result<Tensor, NetworkError> {
        let mask = AttentionMask::padding_mask(piece_ids).context(PaddingMaskSnafu)?;
        decoder_output
            .masked_mean(mask.bool_mask())
            .and_then(|pooled| self.text_projection.forward(&pooled))
            .context(TextEmbeddingSnafu)
    }

    fn embed_pieces(
        &self,
        features: &Tensor,
        piece_ids: &Tensor,
        train: bool,
    ) -> Result<(Seq2SeqOutput, Tensor), NetworkError> {
        let masks = Seq2SeqMasks::for_inputs(features, piece_ids, None).context(MasksSnafu)?;
        let seq2seq_output = self
            .transformer
            .forward_t(features, piece_ids, &masks, train)
            .context(TransformerSnafu)?;
        let last_layer = seq2seq_output
            .decoder_output()
            .last_layer_output()
            .ok_or(NetworkError::NoDecoderOutput)?;
        let text_embedding = self.text_embedding(last_layer, piece_ids)?;
        Ok((seq2seq_output, text_embedding))
    }

    /// Apply the network with known target pieces.
    ///
    /// * `features` - Encoder input features.
    ///   *Shape:* `(batch_size, seq_len, feature_width)`
    /// * `piece_ids` - Target pieces, `0` is padding.
    ///   *Shape:* `(batch_size, target_len)`
    /// * `noise` - Generator noise.
    ///   *Shape:* `(batch_size, noise_width)`
    /// * `train` - Whether to train the network.
    pub fn forward_t(
        &self,
        features: &Tensor,
        piece_ids: &Tensor,
        noise: &Tensor,
        train: bool,
    ) -> Result<NetworkOutput, NetworkError> {
        let (seq2seq_output, text_embedding) = self.embed_pieces(features, piece_ids, train)?;
        let images = self
            .generator
            .render(noise, &text_embedding, train)
            .context(RenderSnafu)?;

        Ok(NetworkOutput {
            images,
            seq2seq_output,
            text_embedding,
        })
    }

    /// Caption the features greedily and render images from the captions.
    ///
    /// * `features` - Encoder input features.
    ///   *Shape:* `(batch_size, seq_len, feature_width)`
    /// * `noise` - Generator noise.
    ///   *Shape:* `(batch_size, noise_width)`
    /// * `config` - Greedy decoding configuration.
    pub fn generate(
        &self,
        features: &Tensor,
        noise: &Tensor,
        config: &GreedyDecodeConfig,
    ) -> Result<Generation, NetworkError> {
        let captions = self
            .transformer
            .greedy_decode(features, None, config)
            .context(CaptionSnafu)?;
        let (_, text_embedding) = self.embed_pieces(features, &captions, false)?;
        let images = self
            .generator
            .render(noise, &text_embedding, false)
            .context(RenderSnafu)?;

        debug!(captions = ?captions.dims(), images = ?images.dims(), "Generated");

        Ok(Generation { captions, images })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::{Network, NetworkConfig};
    use crate::architectures::BuildArchitecture;
    use crate::models::config::tests::small_config_file;
    use crate::models::transformer::GreedyDecodeConfig;
    use crate::util::device::tests::test_devices;

    pub(crate) fn small_network(vb: VarBuilder) -> Result<Network, Whatever> {
        let config = NetworkConfig::try_from(small_config_file())
            .map_err(|e| Whatever::with_source(e, "Cannot convert configuration".to_string()))?;
        config
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build network".to_string()))
    }

    #[test]
    #[report]
    fn network_renders_images_from_pieces() -> Result<(), Whatever> {
        for device in test_devices() {
            let var_map = VarMap::new();
            let network = small_network(VarBuilder::from_varmap(&var_map, DType::F32, &device))?;

            let features = Tensor::randn(0f32, 1., (2, 10, 12), &device)
                .whatever_context("Cannot create features")?;
            let piece_ids = Tensor::new(&[[1u32, 4, 6, 2, 0], [1, 3, 3, 3, 2]], &device)
                .whatever_context("Cannot create piece identifiers")?;
            let noise = Tensor::randn(0f32, 1., (2, 10), &device)
                .whatever_context("Cannot create noise")?;

            let output = network
                .forward_t(&features, &piece_ids, &noise, false)
                .whatever_context("Cannot apply network")?;
            assert_eq!(output.seq2seq_output().logits().dims(), &[2, 5, 20]);
            assert_eq!(output.text_embedding().dims(), &[2, 6]);
            assert_eq!(output.images().dims(), &[2, 3, 16, 16]);
        }
        Ok(())
    }

    #[test]
    #[report]
    fn text_embedding_ignores_padding() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let network = small_network(VarBuilder::from_varmap(&var_map, DType::F32, &device))?;

        let decoder_output = Tensor::randn(0f32, 1., (1, 3, 16), &device)
            .whatever_context("Cannot create decoder output")?;
        let padded = Tensor::randn(0f32, 1., (1, 2, 16), &device)
            .and_then(|padding| Tensor::cat(&[&decoder_output, &padding], 1))
            .whatever_context("Cannot pad decoder output")?;

        let piece_ids =
            Tensor::new(&[[1u32, 5, 2]], &device).whatever_context("Cannot create pieces")?;
        let padded_piece_ids = Tensor::new(&[[1u32, 5, 2, 0, 0]], &device)
            .whatever_context("Cannot create padded pieces")?;

        let embedding = network
            .text_embedding(&decoder_output, &piece_ids)
            .whatever_context("Cannot embed pieces")?
            .flatten_all()
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot read embedding")?;
        let padded_embedding = network
            .text_embedding(&padded, &padded_piece_ids)
            .whatever_context("Cannot embed padded pieces")?
            .flatten_all()
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot read padded embedding")?;

        for (a, b) in embedding.iter().zip(padded_embedding.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }

        Ok(())
    }

    #[test]
    #[report]
    fn network_generates_captions_and_images() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let network = small_network(VarBuilder::from_varmap(&var_map, DType::F32, &device))?;

        let features = Tensor::randn(0f32, 1., (3, 10, 12), &device)
            .whatever_context("Cannot create features")?;
        let noise =
            Tensor::randn(0f32, 1., (3, 10), &device).whatever_context("Cannot create noise")?;

        let generation = network
            .generate(&features, &noise, &GreedyDecodeConfig::default().max_len(5))
            .whatever_context("Cannot generate")?;

        let (batch_size, caption_len) = generation
            .captions()
            .dims2()
            .whatever_context("Invalid caption shape")?;
        assert_eq!(batch_size, 3);
        assert!((2..=5).contains(&caption_len));
        assert_eq!(generation.images().dims(), &[3, 3, 16, 16]);

        Ok(())
    }
}
