//! Image bytes to a fixed-size block of text-space embeddings.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::input::MultimodalPayload;
use super::merge::fingerprint;
use super::processor::ImageProcessor;
use super::projector::Gemma3Projector;
use super::vision::{VisionEncoder, VisionEncoderConfig};
use crate::error::ModelError;
use crate::layers::{avg_pool_1d, checked_tensor};

/// Pooled vectors Gemma 3 emits per image.
pub const DEFAULT_TOKENS_PER_IMAGE: usize = 256;

/// Patch grid and pooling arithmetic for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingGeometry {
    pub patches_per_side: usize,
    pub num_patches: usize,
    pub tokens_per_image: usize,
    /// Kernel and stride of the 1-D average pool.
    pub kernel: usize,
}

impl PoolingGeometry {
    pub fn new(
        image_size: usize,
        patch_size: usize,
        tokens_per_image: usize,
    ) -> Result<Self, ModelError> {
        if patch_size == 0 || image_size < patch_size {
            return Err(ModelError::InvalidConfig(format!(
                "patch size {patch_size} does not fit image size {image_size}"
            )));
        }
        let patches_per_side = image_size / patch_size;
        let num_patches = patches_per_side * patches_per_side;
        if tokens_per_image == 0 || num_patches % tokens_per_image != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "{num_patches} patches cannot pool evenly into {tokens_per_image} tokens"
            )));
        }
        Ok(Self {
            patches_per_side,
            num_patches,
            tokens_per_image,
            kernel: num_patches / tokens_per_image,
        })
    }

    pub fn for_config(cfg: &VisionEncoderConfig, tokens_per_image: usize) -> Result<Self, ModelError> {
        Self::new(cfg.image_size, cfg.patch_size, tokens_per_image)
    }
}

/// Encoded image: projected payload plus content fingerprint.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// `[1, 1, tokens_per_image, text_hidden]`
    pub payload: MultimodalPayload,
    /// FNV-1a 64 of the raw image bytes.
    pub fingerprint: u64,
}

pub struct ImageEncoder {
    processor: ImageProcessor,
    vision: Box<dyn VisionEncoder>,
    projector: Gemma3Projector,
    geometry: PoolingGeometry,
    eps: f64,
    device: Device,
    dtype: DType,
}

impl ImageEncoder {
    pub fn new(
        processor: ImageProcessor,
        vision: Box<dyn VisionEncoder>,
        projector: Gemma3Projector,
        geometry: PoolingGeometry,
        eps: f64,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            processor,
            vision,
            projector,
            geometry,
            eps,
            device,
            dtype,
        }
    }

    pub fn geometry(&self) -> PoolingGeometry {
        self.geometry
    }

    /// Decode, run the vision tower, pool to `tokens_per_image` vectors and
    /// project into the text embedding space.
    pub fn encode(&self, bytes: &[u8]) -> Result<EncodedImage, ModelError> {
        let pixels = self.processor.process(bytes)?;
        let pixel_tensor =
            checked_tensor(&pixels.data, &pixels.dims(), &self.device)?.to_dtype(self.dtype)?;
        let positions = checked_tensor(&[0u32], &[1], &self.device)?;

        let patches = self.vision.forward(&pixel_tensor, &positions)?;
        let pooled = self.pool(&patches)?;
        let projected = self.projector.project(&pooled, self.eps)?;

        let (_, tokens, hidden) = projected.dims3()?;
        let payload = MultimodalPayload::new(projected.reshape((1, 1, tokens, hidden))?)?;
        let fingerprint = fingerprint(bytes);
        debug!(tokens, hidden, fingerprint, "encoded image");
        Ok(EncodedImage {
            payload,
            fingerprint,
        })
    }

    /// `[1, num_patches, hidden] -> [1, tokens_per_image, hidden]`
    fn pool(&self, patches: &Tensor) -> Result<Tensor, ModelError> {
        let (batch, num_patches, hidden) = patches.dims3()?;
        if batch != 1 || num_patches != self.geometry.num_patches {
            return Err(ModelError::Shape(format!(
                "vision tower returned [{batch}, {num_patches}, {hidden}], expected [1, {}, _]",
                self.geometry.num_patches
            )));
        }
        let kernel = self.geometry.kernel;
        let xs = patches.permute((0, 2, 1))?.contiguous()?;
        let xs = avg_pool_1d(&xs, kernel, kernel, 0)?;
        Ok(xs.permute((0, 2, 1))?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multimodal::fingerprint;
    use crate::testing::{gradient_png, png_bytes, tiny_image_encoder};

    #[test]
    fn gemma3_geometry() {
        let g = PoolingGeometry::new(896, 14, DEFAULT_TOKENS_PER_IMAGE).unwrap();
        assert_eq!(g.patches_per_side, 64);
        assert_eq!(g.num_patches, 4096);
        assert_eq!(g.kernel, 16);
        assert_eq!(g.tokens_per_image, 256);
    }

    #[test]
    fn geometry_from_default_vision_config() {
        let g = PoolingGeometry::for_config(&VisionEncoderConfig::default(), 256).unwrap();
        assert_eq!(g.kernel, 16);
    }

    #[test]
    fn uneven_geometry_rejected() {
        // 27 x 27 = 729 patches
        assert!(PoolingGeometry::new(384, 14, 256).is_err());
        assert!(PoolingGeometry::new(896, 0, 256).is_err());
        assert!(PoolingGeometry::new(896, 14, 0).is_err());
    }

    #[test]
    fn encode_emits_pooled_projected_payload() {
        let encoder = tiny_image_encoder(8);
        let bytes = gradient_png(40, 30);
        let encoded = encoder.encode(&bytes).unwrap();
        assert_eq!(encoded.payload.embedding().dims(), &[1, 1, 4, 8]);
        assert_eq!(encoded.fingerprint, fingerprint(&bytes));
    }

    #[test]
    fn encode_is_deterministic() {
        let encoder = tiny_image_encoder(8);
        let bytes = gradient_png(64, 64);
        let a = encoder.encode(&bytes).unwrap();
        let b = encoder.encode(&bytes).unwrap();
        let flat = |e: &EncodedImage| -> Vec<f32> {
            e.payload.embedding().flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_eq!(flat(&a), flat(&b));
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn different_images_differ() {
        let encoder = tiny_image_encoder(8);
        let a = encoder.encode(&png_bytes(8, 8, [255, 0, 0])).unwrap();
        let b = encoder.encode(&png_bytes(8, 8, [0, 0, 255])).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
        let diff = (a.payload.embedding() - b.payload.embedding())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn undecodable_bytes_fail() {
        let encoder = tiny_image_encoder(8);
        let err = encoder.encode(&[0x89, b'P', b'N', b'G']).unwrap_err();
        assert!(matches!(err, ModelError::Decode(_)));
    }
}
