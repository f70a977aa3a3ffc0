//! Vocabulary tables and pretokenizer grammar handed to the upstream tokenizer.
//!
//! Tokenization itself happens outside this crate; the model only validates
//! and carries these tables so the surrounding server can build a tokenizer
//! that agrees with the loaded weights.

use serde::Deserialize;

use crate::error::ModelError;

/// Gemma pretokenizer split grammar.
pub const DEFAULT_PRETOKENIZER: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Tokenizer section of `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub pretokenizer: String,
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
    pub token_types: Vec<u32>,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub add_bos_token: bool,
    pub add_eos_token: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            pretokenizer: DEFAULT_PRETOKENIZER.to_string(),
            tokens: Vec::new(),
            scores: Vec::new(),
            token_types: Vec::new(),
            bos_token_id: 2,
            eos_token_id: 1,
            add_bos_token: true,
            add_eos_token: false,
        }
    }
}

/// SentencePiece token type codes. Codes outside the known set (including
/// 0, "undefined") are kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Other(u32),
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenType {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Normal,
            2 => Self::Unknown,
            3 => Self::Control,
            4 => Self::UserDefined,
            5 => Self::Unused,
            6 => Self::Byte,
            other => Self::Other(other),
        }
    }
}

/// Validated vocabulary: parallel token/score/type tables plus special ids.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    values: Vec<String>,
    scores: Vec<f32>,
    types: Vec<TokenType>,
    bos: u32,
    eos: u32,
    add_bos: bool,
    add_eos: bool,
    pretokenizer: String,
}

impl Vocabulary {
    /// Build from config. An empty token table is accepted (weights-only
    /// setups); otherwise the three tables must line up and the special ids
    /// must be in range. Token type codes are never rejected.
    pub fn from_config(cfg: &TokenizerConfig) -> Result<Self, ModelError> {
        let n = cfg.tokens.len();
        if cfg.scores.len() != n {
            return Err(ModelError::InvalidConfig(format!(
                "scores has {} entries, tokens has {n}",
                cfg.scores.len()
            )));
        }
        if cfg.token_types.len() != n {
            return Err(ModelError::InvalidConfig(format!(
                "token_types has {} entries, tokens has {n}",
                cfg.token_types.len()
            )));
        }
        let types = cfg
            .token_types
            .iter()
            .map(|&code| TokenType::from_code(code))
            .collect();
        if n > 0 {
            for (name, id) in [("bos", cfg.bos_token_id), ("eos", cfg.eos_token_id)] {
                if id as usize >= n {
                    return Err(ModelError::InvalidConfig(format!(
                        "{name} token id {id} out of range for {n} tokens"
                    )));
                }
            }
        }

        Ok(Self {
            values: cfg.tokens.clone(),
            scores: cfg.scores.clone(),
            types,
            bos: cfg.bos_token_id,
            eos: cfg.eos_token_id,
            add_bos: cfg.add_bos_token,
            add_eos: cfg.add_eos_token,
            pretokenizer: cfg.pretokenizer.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.values.get(id as usize).map(String::as_str)
    }

    pub fn score(&self, id: u32) -> Option<f32> {
        self.scores.get(id as usize).copied()
    }

    pub fn token_type(&self, id: u32) -> Option<TokenType> {
        self.types.get(id as usize).copied()
    }

    pub fn bos(&self) -> u32 {
        self.bos
    }

    pub fn eos(&self) -> u32 {
        self.eos
    }

    pub fn pretokenizer(&self) -> &str {
        &self.pretokenizer
    }

    /// Wrap `ids` with BOS/EOS according to the auto-add flags.
    pub fn add_special(&self, ids: Vec<u32>) -> Vec<u32> {
        let mut out = Vec::with_capacity(ids.len() + 2);
        if self.add_bos && ids.first() != Some(&self.bos) {
            out.push(self.bos);
        }
        out.extend(ids);
        if self.add_eos && out.last() != Some(&self.eos) {
            out.push(self.eos);
        }
        out
    }
}
