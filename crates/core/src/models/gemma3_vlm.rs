//! Gemma 3 vision-language model.
//!
//! Combines a SigLIP vision tower with the Gemma 3 text decoder through a
//! pooled, normalized projection.
//!
//! # Weight mapping
//!
//! - `vision_tower.vision_model.*` → SigLIP vision encoder
//! - `multi_modal_projector.mm_soft_emb_norm.*` → Gemma RMSNorm
//! - `multi_modal_projector.mm_input_projection_weight` → input-major projection
//! - `language_model.model.*` → Gemma 3 text decoder

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, warn};

use super::gemma3::Gemma3TextModel;
use super::{ForwardRequest, Model, TextDecoder};
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::kv_cache::DualCache;
use crate::layers::checked_tensor;
use crate::multimodal::{
    merge_placeholders, EncodedImage, Gemma3Projector, ImageEncoder, ImageProcessor, Input,
    PoolingGeometry, SiglipVisionModel, DEFAULT_TOKENS_PER_IMAGE,
};
use crate::tokenizer::Vocabulary;

pub struct Gemma3Model {
    vocabulary: Vocabulary,
    image_encoder: ImageEncoder,
    text_model: Box<dyn TextDecoder>,
    cache: DualCache,
    device: Device,
}

impl Gemma3Model {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let vocabulary = Vocabulary::from_config(&cfg.tokenizer)?;

        let vision_cfg = &cfg.vision_config;
        if vision_cfg.num_channels != 3 {
            return Err(ModelError::InvalidConfig(format!(
                "vision tower expects RGB input, config has {} channels",
                vision_cfg.num_channels
            )));
        }
        let tokens_per_image = cfg
            .extra_usize("mm_tokens_per_image")
            .unwrap_or(DEFAULT_TOKENS_PER_IMAGE);
        let geometry = PoolingGeometry::for_config(vision_cfg, tokens_per_image)?;

        let vision = SiglipVisionModel::new(vision_cfg, vb.pp("vision_tower.vision_model"))?;
        let projector = Gemma3Projector::new(
            vision_cfg.hidden_size,
            cfg.hidden_size,
            vision_cfg.layer_norm_eps,
            vb.pp("multi_modal_projector"),
        )?;
        let image_encoder = ImageEncoder::new(
            ImageProcessor::new(vision_cfg.image_size),
            Box::new(vision),
            projector,
            geometry,
            vision_cfg.layer_norm_eps,
            vb.device().clone(),
            vb.dtype(),
        );

        let text_model = Gemma3TextModel::new(cfg, vb.pp("language_model.model"))?;
        let cache = text_model.new_cache(cfg.sliding_window_len())?;

        debug!(
            layers = text_model.num_layers(),
            sliding_window = cfg.sliding_window_len(),
            tokens_per_image,
            "constructed gemma3"
        );

        Self::from_parts(
            vocabulary,
            image_encoder,
            Box::new(text_model),
            cache,
            vb.device().clone(),
        )
    }

    /// Assemble from prebuilt components. The cache's layer table must
    /// match the attention kind the decoder declares for every layer.
    pub fn from_parts(
        vocabulary: Vocabulary,
        image_encoder: ImageEncoder,
        text_model: Box<dyn TextDecoder>,
        cache: DualCache,
        device: Device,
    ) -> Result<Self, ModelError> {
        for (layer, &kind) in cache.layer_kinds().iter().enumerate() {
            let declared = text_model.attention_kind(layer);
            if declared != Some(kind) {
                return Err(ModelError::InvalidConfig(format!(
                    "cache routes layer {layer} to {kind:?}, decoder declares {declared:?}"
                )));
            }
        }
        let extra = cache.layer_kinds().len();
        if let Some(kind) = text_model.attention_kind(extra) {
            return Err(ModelError::InvalidConfig(format!(
                "decoder declares {kind:?} for layer {extra}, cache has {extra} layers"
            )));
        }

        Ok(Self {
            vocabulary,
            image_encoder,
            text_model,
            cache,
            device,
        })
    }

    pub fn image_encoder(&self) -> &ImageEncoder {
        &self.image_encoder
    }
}

impl Model for Gemma3Model {
    fn encode_multimodal(&self, bytes: &[u8]) -> Result<EncodedImage, ModelError> {
        self.image_encoder.encode(bytes)
    }

    fn post_tokenize(&self, inputs: Vec<Input>) -> Result<Vec<Input>, ModelError> {
        merge_placeholders(inputs)
    }

    fn forward(&mut self, request: &ForwardRequest) -> Result<Tensor, ModelError> {
        let embeddings = match request.multimodal.split_first() {
            Some((first, rest)) => {
                if !rest.is_empty() {
                    warn!(
                        used_index = first.index,
                        ignored = rest.len(),
                        "forward request carries several multimodal payloads; only the first is used"
                    );
                }
                Some(first.payload.embedding().clone())
            }
            None => None,
        };

        let inputs = checked_tensor(&request.inputs, &[request.inputs.len()], &self.device)?;
        let positions =
            checked_tensor(&request.positions, &[request.positions.len()], &self.device)?;
        let outputs = checked_tensor(&request.outputs, &[request.outputs.len()], &self.device)?;

        self.text_model.forward(
            &inputs,
            &positions,
            embeddings.as_ref(),
            &outputs,
            &mut self.cache,
        )
    }

    fn cache(&self) -> &DualCache {
        &self.cache
    }

    fn cache_mut(&mut self) -> &mut DualCache {
        &mut self.cache
    }

    fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }
}
