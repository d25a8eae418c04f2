/// Text-conditioned image generators.
mod text_to_image;
pub use text_to_image::{TextToImage, TextToImageConfig, TextToImageError};
