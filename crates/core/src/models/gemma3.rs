//! Gemma 3 text decoder.
//!
//! ```text
//! Embedding (* sqrt(hidden_size)) -> [Gemma3Layer x N] -> RMSNorm -> LM Head
//!
//! Gemma3Layer:
//!   InputLayerNorm -> Attention -> PostAttnNorm -> Residual
//!   PreFFNorm -> GeGLU MLP -> PostFFNorm -> Residual
//! ```
//!
//! Layers alternate between local (sliding window) and global attention.
//! Every `sliding_window_pattern`-th layer is global; the rest are local and
//! use their own RoPE base frequency.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::trace;

use super::TextDecoder;
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::kv_cache::{
    AttentionKind, CacheError, CausalCache, DualCache, RotationHook, SlidingWindowCache,
};
use crate::layers::{repeat_kv, GeGluMlp, GemmaRmsNorm, RotaryEmbedding};

const DEFAULT_SLIDING_WINDOW_PATTERN: usize = 6;
const DEFAULT_ROPE_LOCAL_BASE_FREQ: f64 = 10_000.0;

// ─── Soft Capping ───────────────────────────────────────────────────────────

fn soft_cap(xs: &Tensor, cap: f64) -> candle_core::Result<Tensor> {
    if cap <= 0.0 {
        return Ok(xs.clone());
    }
    (xs / cap)?.tanh()? * cap
}

// ─── Gemma3 Config Extraction ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct Gemma3TextConfig {
    query_pre_attn_scalar: f64,
    attn_logit_softcap: Option<f64>,
    final_logit_softcap: Option<f64>,
    sliding_window_pattern: usize,
    rope_theta_local: f64,
}

impl Gemma3TextConfig {
    pub(crate) fn from_model_config(cfg: &ModelConfig) -> Self {
        Self {
            query_pre_attn_scalar: cfg
                .extra_f64("query_pre_attn_scalar")
                .unwrap_or(cfg.head_dim as f64),
            attn_logit_softcap: cfg.extra_f64("attn_logit_softcapping"),
            final_logit_softcap: cfg.extra_f64("final_logit_softcapping"),
            sliding_window_pattern: cfg
                .extra_usize("sliding_window_pattern")
                .unwrap_or(DEFAULT_SLIDING_WINDOW_PATTERN),
            rope_theta_local: cfg
                .extra_f64("rope_local_base_freq")
                .unwrap_or(DEFAULT_ROPE_LOCAL_BASE_FREQ),
        }
    }

    /// Attention kind of decoder layer `layer_idx`.
    pub(crate) fn attention_kind(&self, layer_idx: usize) -> AttentionKind {
        if self.sliding_window_pattern == 0 || (layer_idx + 1) % self.sliding_window_pattern == 0
        {
            AttentionKind::Causal
        } else {
            AttentionKind::SlidingWindow
        }
    }
}

// ─── Rotary Shift ───────────────────────────────────────────────────────────

/// Re-encodes cached keys with the RoPE table of the layer they belong to.
pub struct Gemma3RotaryShift {
    local: Arc<RotaryEmbedding>,
    global: Arc<RotaryEmbedding>,
    kinds: Vec<AttentionKind>,
}

impl RotationHook for Gemma3RotaryShift {
    fn shift(&self, layer: usize, key: &Tensor, delta: i64) -> candle_core::Result<Tensor> {
        let rotary = match self.kinds.get(layer) {
            Some(AttentionKind::SlidingWindow) => &self.local,
            Some(AttentionKind::Causal) => &self.global,
            None => candle_core::bail!("rotary shift: no decoder layer {layer}"),
        };
        rotary.rotate(key, delta)
    }
}

// ─── Attention ──────────────────────────────────────────────────────────────

struct Gemma3Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: GemmaRmsNorm,
    k_norm: GemmaRmsNorm,
    rotary_emb: Arc<RotaryEmbedding>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scaling: f64,
    attn_logit_softcap: Option<f64>,
}

impl Gemma3Attention {
    fn new(
        cfg: &ModelConfig,
        text_cfg: &Gemma3TextConfig,
        rotary_emb: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_key_value_heads;
        let head_dim = cfg.head_dim;
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            candle_core::bail!(
                "num_attention_heads ({num_heads}) must be a multiple of num_key_value_heads ({num_kv_heads})"
            )
        }

        Ok(Self {
            q_proj: linear_no_bias(cfg.hidden_size, num_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?,
            q_norm: GemmaRmsNorm::new(head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: GemmaRmsNorm::new(head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?,
            rotary_emb,
            num_heads,
            num_kv_heads,
            head_dim,
            scaling: 1.0 / text_cfg.query_pre_attn_scalar.sqrt(),
            attn_logit_softcap: text_cfg.attn_logit_softcap,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        layer_idx: usize,
        positions: &Tensor,
        query_positions: &[usize],
        cache: &mut DualCache,
    ) -> Result<Tensor, ModelError> {
        let (b_sz, q_len, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;
        let (q, k) = self.rotary_emb.apply(&q, &k, positions)?;

        let view = cache.update(layer_idx, &k, &v)?;
        let mask = view.attention_mask(query_positions, xs.dtype(), xs.device())?;

        let num_kv_groups = self.num_heads / self.num_kv_heads;
        let k_full = repeat_kv(view.key, num_kv_groups)?;
        let v_full = repeat_kv(view.value, num_kv_groups)?;

        let q = (q * self.scaling)?;
        let mut attn_weights = q.matmul(&k_full.transpose(D::Minus2, D::Minus1)?)?;
        if let Some(cap) = self.attn_logit_softcap {
            attn_weights = soft_cap(&attn_weights, cap)?;
        }
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v_full.contiguous()?)?;

        let attn_output =
            attn_output
                .transpose(1, 2)?
                .reshape((b_sz, q_len, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

// ─── Decoder Layer ──────────────────────────────────────────────────────────

struct Gemma3DecoderLayer {
    self_attn: Gemma3Attention,
    mlp: GeGluMlp,
    input_layernorm: GemmaRmsNorm,
    post_attention_layernorm: GemmaRmsNorm,
    pre_feedforward_layernorm: GemmaRmsNorm,
    post_feedforward_layernorm: GemmaRmsNorm,
}

impl Gemma3DecoderLayer {
    fn new(
        cfg: &ModelConfig,
        text_cfg: &Gemma3TextConfig,
        rotary_emb: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let norm = |name: &str| GemmaRmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp(name));
        Ok(Self {
            self_attn: Gemma3Attention::new(cfg, text_cfg, rotary_emb, vb.pp("self_attn"))?,
            mlp: GeGluMlp::new(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp"))?,
            input_layernorm: norm("input_layernorm")?,
            post_attention_layernorm: norm("post_attention_layernorm")?,
            pre_feedforward_layernorm: norm("pre_feedforward_layernorm")?,
            post_feedforward_layernorm: norm("post_feedforward_layernorm")?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        layer_idx: usize,
        positions: &Tensor,
        query_positions: &[usize],
        cache: &mut DualCache,
    ) -> Result<Tensor, ModelError> {
        let residual = xs;
        let hidden_states = self.input_layernorm.forward(xs)?;
        let hidden_states =
            self.self_attn
                .forward(&hidden_states, layer_idx, positions, query_positions, cache)?;
        let hidden_states = self.post_attention_layernorm.forward(&hidden_states)?;
        let hidden_states = (hidden_states + residual)?;
        let residual = &hidden_states;

        let hidden_states = self.pre_feedforward_layernorm.forward(&hidden_states)?;
        let hidden_states = self.mlp.forward(&hidden_states)?;
        let hidden_states = self.post_feedforward_layernorm.forward(&hidden_states)?;
        Ok((residual + hidden_states)?)
    }
}

// ─── Model ──────────────────────────────────────────────────────────────────

pub struct Gemma3TextModel {
    embed_tokens: Embedding,
    layers: Vec<Gemma3DecoderLayer>,
    norm: GemmaRmsNorm,
    lm_head: Linear,
    kinds: Vec<AttentionKind>,
    rotary_local: Arc<RotaryEmbedding>,
    rotary_global: Arc<RotaryEmbedding>,
    final_logit_softcap: Option<f64>,
    hidden_size: usize,
    vocab_size: usize,
    device: Device,
    dtype: DType,
}

impl Gemma3TextModel {
    /// `vb` points at the text tower root (the one holding `embed_tokens`).
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let text_cfg = Gemma3TextConfig::from_model_config(cfg);

        let rotary_local = Arc::new(RotaryEmbedding::new(
            cfg.head_dim,
            cfg.max_position_embeddings,
            text_cfg.rope_theta_local,
            vb.dtype(),
            vb.device(),
        )?);
        let rotary_global = Arc::new(RotaryEmbedding::new(
            cfg.head_dim,
            cfg.max_position_embeddings,
            cfg.rope_theta,
            vb.dtype(),
            vb.device(),
        )?);

        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;

        let kinds: Vec<AttentionKind> = (0..cfg.num_hidden_layers)
            .map(|i| text_cfg.attention_kind(i))
            .collect();

        let vb_l = vb.pp("layers");
        let layers = kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                let rotary = match kind {
                    AttentionKind::SlidingWindow => rotary_local.clone(),
                    AttentionKind::Causal => rotary_global.clone(),
                };
                Gemma3DecoderLayer::new(cfg, &text_cfg, rotary, vb_l.pp(i))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let norm = GemmaRmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        // tied word embeddings
        let lm_head = Linear::new(embed_tokens.embeddings().clone(), None);

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            kinds,
            rotary_local,
            rotary_global,
            final_logit_softcap: text_cfg.final_logit_softcap,
            hidden_size: cfg.hidden_size,
            vocab_size: cfg.vocab_size,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn attention_kinds(&self) -> &[AttentionKind] {
        &self.kinds
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Hook the dual cache uses to re-encode keys after a context shift.
    pub fn rotary_shift(&self) -> Arc<dyn RotationHook> {
        Arc::new(Gemma3RotaryShift {
            local: self.rotary_local.clone(),
            global: self.rotary_global.clone(),
            kinds: self.kinds.clone(),
        })
    }

    /// Empty session cache laid out for this decoder: one regime per
    /// attention kind, the layer table of [`Self::attention_kinds`] and the
    /// rotary shift hook.
    pub fn new_cache(&self, sliding_window: usize) -> Result<DualCache, CacheError> {
        let hook = self.rotary_shift();
        Ok(DualCache::new(
            SlidingWindowCache::new(sliding_window, hook.clone())?,
            CausalCache::new(hook),
            self.kinds.clone(),
        ))
    }

    /// Zero-token pass: still records the (empty) batch with the cache and
    /// returns `[0, vocab_size]` logits.
    fn forward_empty(
        &self,
        inputs: &Tensor,
        embeddings: Option<&Tensor>,
        outputs: &Tensor,
        cache: &mut DualCache,
    ) -> Result<Tensor, ModelError> {
        let tokens = inputs.dim(0)?;
        let rows = embeddings.map_or(0, |e| e.elem_count());
        let selected = outputs.dim(0)?;
        if tokens != 0 || rows != 0 || selected != 0 {
            return Err(ModelError::Shape(format!(
                "request has no positions but {tokens} tokens, {rows} embedding values \
                 and {selected} output rows"
            )));
        }
        cache.start_forward(&[])?;
        Ok(Tensor::zeros((0, self.vocab_size), self.dtype, &self.device)?)
    }

    fn initial_hidden_states(
        &self,
        inputs: &Tensor,
        embeddings: Option<&Tensor>,
        num_positions: usize,
    ) -> Result<Tensor, ModelError> {
        match embeddings {
            Some(embeddings) => {
                let hidden = *embeddings.dims().last().unwrap_or(&0);
                let rows = embeddings.elem_count() / hidden.max(1);
                if hidden != self.hidden_size || rows != num_positions {
                    return Err(ModelError::Shape(format!(
                        "embeddings {:?} do not provide {num_positions} rows of width {}",
                        embeddings.dims(),
                        self.hidden_size
                    )));
                }
                Ok(embeddings
                    .reshape((1, rows, hidden))?
                    .to_dtype(self.dtype)?)
            }
            None => {
                let num_tokens = inputs.dim(0)?;
                if num_tokens != num_positions {
                    return Err(ModelError::Shape(format!(
                        "{num_tokens} tokens but {num_positions} positions"
                    )));
                }
                let normalizer = (self.hidden_size as f64).sqrt();
                Ok((self.embed_tokens.forward(inputs)? * normalizer)?.unsqueeze(0)?)
            }
        }
    }
}

impl TextDecoder for Gemma3TextModel {
    fn forward(
        &self,
        inputs: &Tensor,
        positions: &Tensor,
        embeddings: Option<&Tensor>,
        outputs: &Tensor,
        cache: &mut DualCache,
    ) -> Result<Tensor, ModelError> {
        let query_positions: Vec<usize> = positions
            .to_vec1::<u32>()?
            .into_iter()
            .map(|p| p as usize)
            .collect();
        if query_positions.is_empty() {
            return self.forward_empty(inputs, embeddings, outputs, cache);
        }
        let mut xs = self.initial_hidden_states(inputs, embeddings, query_positions.len())?;

        cache.start_forward(&query_positions)?;
        trace!(tokens = query_positions.len(), "gemma3 forward");

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs, layer_idx, positions, &query_positions, cache)?;
        }

        let xs = self.norm.forward(&xs)?.squeeze(0)?;
        let xs = xs.index_select(outputs, 0)?;
        let mut logits = self.lm_head.forward(&xs)?;
        if let Some(cap) = self.final_logit_softcap {
            logits = soft_cap(&logits, cap)?;
        }
        Ok(logits)
    }

    fn attention_kind(&self, layer: usize) -> Option<AttentionKind> {
        self.kinds.get(layer).copied()
    }
}
