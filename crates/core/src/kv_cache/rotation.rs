use candle_core::{Result, Tensor};

/// Re-encodes the positional component of cached keys.
///
/// The model owns the positional encoding, so caches hold a shared handle to
/// it and call back when a removal changes the offset of retained entries.
/// Implementations run synchronously inside the cache mutation and only
/// rotate existing keys; they never create positions.
pub trait RotationHook: Send + Sync {
    /// `key`: `[1, num_kv_heads, t, head_dim]` for decoder layer `layer`.
    /// Returns the keys re-encoded as if they sat `delta` positions later.
    fn shift(&self, layer: usize, key: &Tensor, delta: i64) -> Result<Tensor>;
}

/// Hook for models without positional keys. Leaves keys untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRotation;

impl RotationHook for NoRotation {
    fn shift(&self, _layer: usize, key: &Tensor, _delta: i64) -> Result<Tensor> {
        Ok(key.clone())
    }
}
