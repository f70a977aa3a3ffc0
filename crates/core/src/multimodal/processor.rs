//! Image decode and normalization ahead of the vision tower.

use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::ModelError;

pub const IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];
pub const RESCALE_FACTOR: f32 = 1.0 / 255.0;

/// Channel-first pixel buffer for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelValues {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl PixelValues {
    pub fn dims(&self) -> [usize; 4] {
        [1, self.channels, self.height, self.width]
    }
}

/// Square resize to the tower resolution, rescale, normalize.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    image_size: usize,
    mean: [f32; 3],
    std: [f32; 3],
}

impl ImageProcessor {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            mean: IMAGE_MEAN,
            std: IMAGE_STD,
        }
    }

    /// Decode any supported container (PNG, JPEG, GIF, WebP).
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ModelError> {
        Ok(image::load_from_memory(bytes)?)
    }

    pub fn preprocess(&self, image: &DynamicImage) -> PixelValues {
        let size = self.image_size as u32;
        let rgb = image
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let plane = self.image_size * self.image_size;
        let mut data = vec![0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let v = pixel.0[c] as f32 * RESCALE_FACTOR;
                data[c * plane + i] = (v - self.mean[c]) / self.std[c];
            }
        }

        PixelValues {
            data,
            channels: 3,
            height: self.image_size,
            width: self.image_size,
        }
    }

    pub fn process(&self, bytes: &[u8]) -> Result<PixelValues, ModelError> {
        let image = self.decode(bytes)?;
        Ok(self.preprocess(&image))
    }
}
