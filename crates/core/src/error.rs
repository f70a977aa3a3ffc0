use thiserror::Error;

use crate::kv_cache::CacheError;

/// Errors surfaced by model construction, image encoding and forward dispatch.
///
/// Nothing in this crate retries or swallows an error; each operation returns
/// the first failure it hits.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("tensor error: {0}")]
    Tensor(candle_core::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    pub fn is_shape(&self) -> bool {
        matches!(self, Self::Shape(_))
    }
}

impl From<candle_core::Error> for ModelError {
    fn from(err: candle_core::Error) -> Self {
        if is_shape_error(&err) {
            Self::Shape(err.to_string())
        } else {
            Self::Tensor(err)
        }
    }
}

fn is_shape_error(err: &candle_core::Error) -> bool {
    use candle_core::Error;
    match err {
        Error::ShapeMismatch { .. }
        | Error::ShapeMismatchBinaryOp { .. }
        | Error::ShapeMismatchCat { .. }
        | Error::UnexpectedNumberOfDims { .. }
        | Error::UnexpectedShape { .. } => true,
        Error::WithBacktrace { inner, .. } | Error::Context { inner, .. } => is_shape_error(inner),
        _ => false,
    }
}
