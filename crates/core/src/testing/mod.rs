//! Shared test utilities for vlm-core.

mod mock_model;
mod tiny_config;

pub use mock_model::{DecoderCall, MockVisionEncoder, RecordingDecoder};
pub use tiny_config::{tiny_gemma3_config, tiny_image_encoder};

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// PNG encoding of a solid-color `width x height` image.
pub fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(rgb));
    encode_png(img)
}

/// PNG with a horizontal gradient, so patches differ from each other.
pub fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let v = ((x * 255) / width.max(1)) as u8;
        Rgb([v, 255 - v, (y % 256) as u8])
    });
    encode_png(img)
}

fn encode_png(img: RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("png encoding of an in-memory image");
    buf.into_inner()
}
