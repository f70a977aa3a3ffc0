//! SigLIP vision tower used by Gemma 3.
//!
//! The image encoder only depends on the [`VisionEncoder`] trait; the
//! SigLIP implementation here is the one the Gemma 3 constructor builds.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

/// Vision tower section of `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionEncoderConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    /// Square input resolution.
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub layer_norm_eps: f64,
}

impl Default for VisionEncoderConfig {
    fn default() -> Self {
        // SigLIP So400m/14 @ 896px as shipped with Gemma 3
        Self {
            hidden_size: 1152,
            intermediate_size: 4304,
            num_attention_heads: 16,
            num_hidden_layers: 27,
            image_size: 896,
            patch_size: 14,
            num_channels: 3,
            layer_norm_eps: 1e-6,
        }
    }
}

impl VisionEncoderConfig {
    pub fn patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        let n = self.patches_per_side();
        n * n
    }
}

/// Turns a pixel tensor into one embedding per patch.
pub trait VisionEncoder: Send + Sync {
    /// `pixels`: `[1, channels, image_size, image_size]`; `positions`: `[1]`
    /// u32 offset into the learned position table.
    /// Returns `[1, num_patches, hidden_size]`.
    fn forward(&self, pixels: &Tensor, positions: &Tensor) -> Result<Tensor>;

    fn hidden_size(&self) -> usize;
}

// ─── Patch Embedding ─────────────────────────────────────────────────────────

struct PatchEmbedding {
    proj: Conv2d,
}

impl PatchEmbedding {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                padding: 0,
                dilation: 1,
                groups: 1,
                cudnn_fwd_algo: None,
            },
            vb.pp("patch_embedding"),
        )?;
        Ok(Self { proj })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        // [b, hidden, ph, pw] -> [b, patches, hidden]
        self.proj.forward(pixel_values)?.flatten(2, 3)?.transpose(1, 2)
    }
}

// ─── Attention ───────────────────────────────────────────────────────────────

struct SiglipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SiglipAttention {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let head_dim = h / cfg.num_attention_heads;
        Ok(Self {
            q_proj: candle_nn::linear(h, h, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(h, h, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(h, h, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = xs.dims3()?;
        let split = |t: Tensor| {
            t.reshape((b, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.q_proj.forward(xs)?)?;
        let k = split(self.k_proj.forward(xs)?)?;
        let v = split(self.v_proj.forward(xs)?)?;

        let attn = (q.matmul(&k.t()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }
}

// ─── MLP ─────────────────────────────────────────────────────────────────────

struct SiglipMlp {
    fc1: Linear,
    fc2: Linear,
}

impl SiglipMlp {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self
            .fc1
            .forward(xs)?
            .apply(&candle_nn::Activation::GeluPytorchTanh)?;
        self.fc2.forward(&hidden)
    }
}

// ─── Encoder Layer ───────────────────────────────────────────────────────────

struct SiglipEncoderLayer {
    self_attn: SiglipAttention,
    mlp: SiglipMlp,
    layer_norm1: LayerNorm,
    layer_norm2: LayerNorm,
}

impl SiglipEncoderLayer {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: SiglipAttention::new(cfg, vb.pp("self_attn"))?,
            mlp: SiglipMlp::new(cfg, vb.pp("mlp"))?,
            layer_norm1: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("layer_norm1"),
            )?,
            layer_norm2: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("layer_norm2"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(xs)?)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let out = self.mlp.forward(&self.layer_norm2.forward(&xs)?)?;
        residual + out
    }
}

// ─── Vision Model ────────────────────────────────────────────────────────────

/// SigLIP vision transformer: patch conv, learned positions, pre-norm
/// encoder layers, post layernorm. No CLS token.
pub struct SiglipVisionModel {
    patch_embedding: PatchEmbedding,
    position_embedding: Embedding,
    layers: Vec<SiglipEncoderLayer>,
    post_layernorm: LayerNorm,
    config: VisionEncoderConfig,
    device: Device,
    dtype: DType,
}

impl SiglipVisionModel {
    pub fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let vb_emb = vb.pp("embeddings");
        let patch_embedding = PatchEmbedding::new(cfg, vb_emb.clone())?;
        let position_embedding = candle_nn::embedding(
            cfg.num_patches(),
            cfg.hidden_size,
            vb_emb.pp("position_embedding"),
        )?;

        let vb_layers = vb.pp("encoder.layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| SiglipEncoderLayer::new(cfg, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let post_layernorm =
            candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("post_layernorm"))?;

        Ok(Self {
            patch_embedding,
            position_embedding,
            layers,
            post_layernorm,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }
}

impl VisionEncoder for SiglipVisionModel {
    fn forward(&self, pixels: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let pixels = pixels.to_dtype(self.dtype)?;
        let mut xs = self.patch_embedding.forward(&pixels)?;

        let seq_len = xs.dim(1)?;
        let offset = positions.flatten_all()?.to_vec1::<u32>()?.first().copied().unwrap_or(0);
        let position_ids =
            Tensor::arange(offset, offset + seq_len as u32, &self.device)?;
        xs = xs.broadcast_add(&self.position_embedding.forward(&position_ids)?)?;

        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        self.post_layernorm.forward(&xs)
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> VisionEncoderConfig {
        VisionEncoderConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_hidden_layers: 2,
            image_size: 28,
            patch_size: 7,
            ..Default::default()
        }
    }

    #[test]
    fn gemma3_patch_geometry() {
        let cfg = VisionEncoderConfig::default();
        assert_eq!(cfg.patches_per_side(), 64);
        assert_eq!(cfg.num_patches(), 4096);
    }

    #[test]
    fn forward_emits_one_vector_per_patch() {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let model = SiglipVisionModel::new(&cfg, VarBuilder::zeros(DType::F32, &device)).unwrap();

        let pixels = Tensor::randn(0f32, 1.0, (1, 3, 28, 28), &device).unwrap();
        let positions = Tensor::new(&[0u32], &device).unwrap();
        let out = model.forward(&pixels, &positions).unwrap();
        assert_eq!(out.dims(), &[1, 16, 32]);
        assert_eq!(model.hidden_size(), 32);
    }

    #[test]
    fn position_offset_out_of_table_fails() {
        let device = Device::Cpu;
        let model =
            SiglipVisionModel::new(&tiny_config(), VarBuilder::zeros(DType::F32, &device)).unwrap();
        let pixels = Tensor::zeros((1, 3, 28, 28), DType::F32, &device).unwrap();
        let positions = Tensor::new(&[8u32], &device).unwrap();
        assert!(model.forward(&pixels, &positions).is_err());
    }

    #[test]
    fn deserializes_partial_section() {
        let cfg: VisionEncoderConfig =
            serde_json::from_str(r#"{"image_size": 224, "patch_size": 16}"#).unwrap();
        assert_eq!(cfg.patches_per_side(), 14);
        assert_eq!(cfg.hidden_size, 1152);
    }
}
