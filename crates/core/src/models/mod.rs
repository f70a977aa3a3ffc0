//! Model surface: the traits the serving layer drives and the Gemma 3
//! implementation behind them.

mod forward;
pub mod gemma3;
pub mod gemma3_vlm;
pub mod registry;

pub use forward::ForwardRequest;
pub use gemma3::{Gemma3RotaryShift, Gemma3TextModel};
pub use gemma3_vlm::Gemma3Model;
pub use registry::{ModelConstructor, ModelRegistry};

use candle_core::Tensor;

use crate::error::ModelError;
use crate::kv_cache::{AttentionKind, DualCache};
use crate::multimodal::{EncodedImage, Input};
use crate::tokenizer::Vocabulary;

/// Decoder-only language model addressed by the forward assembler.
pub trait TextDecoder: Send {
    /// * `inputs`: u32 token ids `[t]`
    /// * `positions`: u32 sequence positions `[t]`
    /// * `embeddings`: when set, supplies the hidden state in place of the
    ///   token lookup, one row per position
    /// * `outputs`: u32 indices into the batch whose logits are returned
    ///
    /// Advances `cache`. Returns `[outputs.len(), vocab_size]`.
    fn forward(
        &self,
        inputs: &Tensor,
        positions: &Tensor,
        embeddings: Option<&Tensor>,
        outputs: &Tensor,
        cache: &mut DualCache,
    ) -> Result<Tensor, ModelError>;

    /// Cache regime decoder layer `layer` reads and writes.
    fn attention_kind(&self, layer: usize) -> Option<AttentionKind>;
}

/// A loaded multimodal model with its per-session cache.
pub trait Model: Send {
    fn encode_multimodal(&self, bytes: &[u8]) -> Result<EncodedImage, ModelError>;

    /// Rewrite the tokenized prompt before batching.
    fn post_tokenize(&self, inputs: Vec<Input>) -> Result<Vec<Input>, ModelError>;

    /// Run one forward pass, advancing the session cache. A failure midway
    /// leaves the cache as far as it got; it is not rolled back.
    fn forward(&mut self, request: &ForwardRequest) -> Result<Tensor, ModelError>;

    fn cache(&self) -> &DualCache;

    fn cache_mut(&mut self) -> &mut DualCache;

    fn vocabulary(&self) -> &Vocabulary;
}
