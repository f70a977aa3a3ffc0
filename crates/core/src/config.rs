use serde::Deserialize;

use crate::multimodal::VisionEncoderConfig;
use crate::tokenizer::TokenizerConfig;

/// Sliding window used when `config.json` does not name one (Gemma 3 default).
pub const DEFAULT_SLIDING_WINDOW: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_architectures")]
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,

    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default)]
    pub vision_config: VisionEncoderConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_architectures() -> Vec<String> {
    vec!["gemma3".to_string()]
}

impl ModelConfig {
    /// Parse a `config.json` document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sliding-window length for local attention layers.
    pub fn sliding_window_len(&self) -> usize {
        self.sliding_window.unwrap_or(DEFAULT_SLIDING_WINDOW)
    }

    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(|v| v.as_f64())
    }

    pub fn extra_usize(&self, key: &str) -> Option<usize> {
        self.extra
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Gemma 3 4B text tower
        Self {
            architectures: default_architectures(),
            hidden_size: 2560,
            num_attention_heads: 8,
            num_key_value_heads: 4,
            num_hidden_layers: 34,
            intermediate_size: 10240,
            vocab_size: 262_208,
            max_position_embeddings: 131_072,
            head_dim: 256,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            sliding_window: Some(1024),
            vision_config: VisionEncoderConfig::default(),
            tokenizer: TokenizerConfig::default(),
            extra: serde_json::Map::new(),
        }
    }
}
