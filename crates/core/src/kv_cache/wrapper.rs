use candle_core::Tensor;

use super::{AttentionKind, CacheError, CacheView, CausalCache, KvCache, SlidingWindowCache};

/// One logical cache made of a sliding-window regime and a causal regime.
///
/// The layer table is fixed at construction: every decoder layer declares
/// its attention kind once and [`DualCache::update`] routes that layer's
/// writes to the matching regime. Position bookkeeping (`start_forward`,
/// `remove`) always fans out to both regimes so they agree on positions.
pub struct DualCache {
    sliding: SlidingWindowCache,
    causal: CausalCache,
    layer_kinds: Vec<AttentionKind>,
}

impl DualCache {
    pub fn new(
        sliding: SlidingWindowCache,
        causal: CausalCache,
        layer_kinds: Vec<AttentionKind>,
    ) -> Self {
        Self {
            sliding,
            causal,
            layer_kinds,
        }
    }

    pub fn layer_kinds(&self) -> &[AttentionKind] {
        &self.layer_kinds
    }

    /// Attention kind declared for `layer`.
    pub fn attention_kind(&self, layer: usize) -> Result<AttentionKind, CacheError> {
        self.layer_kinds
            .get(layer)
            .copied()
            .ok_or(CacheError::UnknownLayer {
                layer,
                layers: self.layer_kinds.len(),
            })
    }

    pub fn regime(&mut self, kind: AttentionKind) -> &mut dyn KvCache {
        match kind {
            AttentionKind::SlidingWindow => &mut self.sliding,
            AttentionKind::Causal => &mut self.causal,
        }
    }

    pub fn regime_ref(&self, kind: AttentionKind) -> &dyn KvCache {
        match kind {
            AttentionKind::SlidingWindow => &self.sliding,
            AttentionKind::Causal => &self.causal,
        }
    }

    pub fn sliding_window(&self) -> usize {
        self.sliding.window()
    }

    pub fn start_forward(&mut self, positions: &[usize]) -> Result<(), CacheError> {
        self.sliding.start_forward(positions)?;
        self.causal.start_forward(positions)
    }

    /// Append entries for `layer` in the regime its declared kind selects.
    pub fn update(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<CacheView, CacheError> {
        let kind = self.attention_kind(layer)?;
        self.regime(kind).update(layer, key, value)
    }

    pub fn remove(&mut self, begin: usize, end: usize) -> Result<(), CacheError> {
        self.sliding.remove(begin, end)?;
        self.causal.remove(begin, end)
    }

    pub fn next_position(&self) -> usize {
        self.sliding.next_position().max(self.causal.next_position())
    }

    pub fn reset(&mut self) {
        self.sliding.reset();
        self.causal.reset();
    }
}
