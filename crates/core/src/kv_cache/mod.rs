//! Per-session key/value cache with a sliding-window and a causal regime.

mod causal;
mod error;
mod rotation;
mod sliding_window;
mod store;
mod wrapper;

pub use causal::CausalCache;
pub use error::CacheError;
pub use rotation::{NoRotation, RotationHook};
pub use sliding_window::SlidingWindowCache;
pub use wrapper::DualCache;

use candle_core::{DType, Device, Tensor};

use crate::layers::position_mask;

/// Attention kind a decoder layer declares; selects its cache regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionKind {
    SlidingWindow,
    Causal,
}

/// History visible to a layer after appending the current batch.
#[derive(Debug, Clone)]
pub struct CacheView {
    /// `[1, num_kv_heads, kv_len, head_dim]`
    pub key: Tensor,
    pub value: Tensor,
    /// Sequence position of every entry along `kv_len`.
    pub positions: Vec<usize>,
    pub window: Option<usize>,
}

impl CacheView {
    /// Additive `[1, 1, q_len, kv_len]` mask for this view.
    pub fn attention_mask(
        &self,
        query_positions: &[usize],
        dtype: DType,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        position_mask(query_positions, &self.positions, self.window, dtype, device)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// One cache regime, addressed per decoder layer.
pub trait KvCache: Send {
    /// Record the query positions of the coming forward pass.
    fn start_forward(&mut self, positions: &[usize]) -> Result<(), CacheError>;

    /// Append `[1, num_kv_heads, t, head_dim]` entries for the positions
    /// recorded by `start_forward` and return the layer's visible history.
    fn update(&mut self, layer: usize, key: &Tensor, value: &Tensor)
        -> Result<CacheView, CacheError>;

    /// Drop positions `[begin, end)`; later entries move down by `end - begin`.
    fn remove(&mut self, begin: usize, end: usize) -> Result<(), CacheError>;

    fn len(&self, layer: usize) -> usize;

    fn positions(&self, layer: usize) -> &[usize];

    /// One past the highest committed position.
    fn next_position(&self) -> usize;

    fn reset(&mut self);
}
