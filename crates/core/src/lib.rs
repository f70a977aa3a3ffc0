//! Request assembly and dispatch for a local multimodal Gemma 3 runtime.
//!
//! The crate turns image bytes into fixed-size embedding blocks, folds
//! adjacent image placeholders in a tokenized prompt into one fused unit,
//! and hands each forward call to the text decoder together with a
//! per-session cache that keeps local-attention layers inside their window.

pub mod config;
pub mod error;
pub mod kv_cache;
pub mod layers;
pub mod loader;
pub mod models;
pub mod multimodal;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::ModelConfig;
pub use error::ModelError;
pub use models::{ForwardRequest, Model, ModelRegistry, TextDecoder};
pub use multimodal::{EncodedImage, Input, MultimodalIndex, MultimodalPayload};
