//! Image side of the model: decode, vision tower, pooling, projection, and
//! folding of adjacent image placeholders.

mod encoder;
mod input;
mod merge;
mod processor;
mod projector;
mod vision;

pub use encoder::{EncodedImage, ImageEncoder, PoolingGeometry, DEFAULT_TOKENS_PER_IMAGE};
pub use input::{Input, MultimodalIndex, MultimodalPayload};
pub use merge::{combine_hashes, fingerprint, merge_placeholders};
pub use processor::{ImageProcessor, PixelValues, IMAGE_MEAN, IMAGE_STD};
pub use projector::{Gemma3Projector, InputMajorWeight};
pub use vision::{SiglipVisionModel, VisionEncoder, VisionEncoderConfig};
