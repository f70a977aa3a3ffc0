use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::ModelConfig;
use crate::multimodal::{
    Gemma3Projector, ImageEncoder, ImageProcessor, PoolingGeometry, VisionEncoderConfig,
};

use super::MockVisionEncoder;

/// Two-layer Gemma 3 with a 28px / 7px vision tower pooled to 4 tokens.
pub fn tiny_gemma3_config() -> ModelConfig {
    let mut cfg = ModelConfig {
        hidden_size: 32,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        num_hidden_layers: 2,
        intermediate_size: 64,
        vocab_size: 64,
        max_position_embeddings: 64,
        head_dim: 8,
        sliding_window: Some(4),
        vision_config: VisionEncoderConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 2,
            num_hidden_layers: 1,
            image_size: 28,
            patch_size: 7,
            ..VisionEncoderConfig::default()
        },
        ..ModelConfig::default()
    };
    cfg.extra
        .insert("mm_tokens_per_image".to_string(), serde_json::json!(4));
    cfg.extra
        .insert("sliding_window_pattern".to_string(), serde_json::json!(2));
    cfg
}

/// Image encoder over [`MockVisionEncoder`] with a non-trivial projection,
/// 28px input, 7px patches, 4 pooled tokens of width `text_hidden`.
pub fn tiny_image_encoder(text_hidden: usize) -> ImageEncoder {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    tensors.insert(
        "mm_soft_emb_norm.weight".to_string(),
        Tensor::zeros(3, DType::F32, &device).expect("norm weight"),
    );
    let projection: Vec<f32> = (0..3 * text_hidden).map(|i| (i % 7) as f32 - 3.0).collect();
    tensors.insert(
        "mm_input_projection_weight".to_string(),
        Tensor::from_vec(projection, (3, text_hidden), &device).expect("projection weight"),
    );
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
    let projector = Gemma3Projector::new(3, text_hidden, 1e-6, vb).expect("projector");
    let geometry = PoolingGeometry::new(28, 7, 4).expect("geometry");

    ImageEncoder::new(
        ImageProcessor::new(28),
        Box::new(MockVisionEncoder::new(7, 3)),
        projector,
        geometry,
        1e-6,
        device,
        DType::F32,
    )
}
