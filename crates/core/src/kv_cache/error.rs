use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid remove range {begin}..{end}: committed positions end at {committed}")]
    InvalidRange {
        begin: usize,
        end: usize,
        committed: usize,
    },

    #[error("layer {layer}: got {got} new entries, forward batch has {expected} positions")]
    BatchMismatch {
        layer: usize,
        expected: usize,
        got: usize,
    },

    #[error("layer {layer} has no declared attention kind ({layers} layers)")]
    UnknownLayer { layer: usize, layers: usize },

    #[error("sliding window length must be positive")]
    ZeroWindow,

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
