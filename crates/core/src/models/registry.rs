//! Name → constructor table for supported architectures.
//!
//! The registry is an ordinary value: callers build one (usually with
//! [`ModelRegistry::with_defaults`]), may add their own entries, and look
//! architectures up by the names `config.json` uses.

use std::collections::BTreeMap;

use candle_nn::VarBuilder;
use tracing::info;

use super::gemma3_vlm::Gemma3Model;
use super::Model;
use crate::config::ModelConfig;
use crate::error::ModelError;

pub type ModelConstructor = fn(&ModelConfig, VarBuilder) -> Result<Box<dyn Model>, ModelError>;

/// Architecture names Gemma 3 checkpoints declare.
pub const GEMMA3_ARCH_NAMES: &[&str] = &["gemma3", "Gemma3ForConditionalGeneration"];

fn construct_gemma3(cfg: &ModelConfig, vb: VarBuilder) -> Result<Box<dyn Model>, ModelError> {
    Ok(Box::new(Gemma3Model::new(cfg, vb)?))
}

#[derive(Default)]
pub struct ModelRegistry {
    constructors: BTreeMap<String, ModelConstructor>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for name in GEMMA3_ARCH_NAMES {
            registry.register(name, construct_gemma3);
        }
        registry
    }

    /// Register `constructor` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, constructor: ModelConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn construct(
        &self,
        name: &str,
        cfg: &ModelConfig,
        vb: VarBuilder,
    ) -> Result<Box<dyn Model>, ModelError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ModelError::UnsupportedArchitecture(name.to_string()))?;
        info!(architecture = name, "constructing model");
        constructor(cfg, vb)
    }

    /// Construct using the first architecture in `cfg.architectures` that is
    /// registered.
    pub fn construct_from_config(
        &self,
        cfg: &ModelConfig,
        vb: VarBuilder,
    ) -> Result<Box<dyn Model>, ModelError> {
        let name = cfg
            .architectures
            .iter()
            .find(|name| self.contains(name))
            .ok_or_else(|| ModelError::UnsupportedArchitecture(cfg.architectures.join(", ")))?;
        self.construct(name, cfg, vb)
    }
}
