use std::sync::Arc;

use candle_core::Tensor;
use tracing::debug;

use super::store::LayerStore;
use super::{CacheError, CacheView, KvCache, RotationHook};

/// Bounded cache for local-attention layers.
///
/// At the start of every forward pass, entries that no query in the batch
/// can attend to (`pos + window <= min(query positions)`) are dropped, so
/// each layer holds at most `window - 1 + batch` entries and attention over
/// the returned view only ever reaches the last `window` positions.
pub struct SlidingWindowCache {
    window: usize,
    store: LayerStore,
}

impl SlidingWindowCache {
    pub fn new(window: usize, hook: Arc<dyn RotationHook>) -> Result<Self, CacheError> {
        if window == 0 {
            return Err(CacheError::ZeroWindow);
        }
        Ok(Self {
            window,
            store: LayerStore::new(Some(window), hook),
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl KvCache for SlidingWindowCache {
    fn start_forward(&mut self, positions: &[usize]) -> Result<(), CacheError> {
        self.store.start_forward(positions);
        let Some(&min_query) = positions.iter().min() else {
            return Ok(());
        };
        let threshold = (min_query + 1).saturating_sub(self.window);
        if threshold > 0 {
            let evicted = self.store.evict_below(threshold)?;
            if evicted > 0 {
                debug!(
                    evicted,
                    threshold,
                    layers = self.store.num_layers(),
                    "sliding window eviction"
                );
            }
        }
        Ok(())
    }

    fn update(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<CacheView, CacheError> {
        self.store.append(layer, key, value)
    }

    fn remove(&mut self, begin: usize, end: usize) -> Result<(), CacheError> {
        self.store.remove(begin, end)
    }

    fn len(&self, layer: usize) -> usize {
        self.store.len(layer)
    }

    fn positions(&self, layer: usize) -> &[usize] {
        self.store.positions(layer)
    }

    fn next_position(&self) -> usize {
        self.store.next_position()
    }

    fn reset(&mut self) {
        self.store.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::NoRotation;
    use candle_core::{DType, Device};

    fn kv(t: usize) -> (Tensor, Tensor) {
        let k = Tensor::zeros((1, 1, t, 2), DType::F32, &Device::Cpu).unwrap();
        (k.clone(), k)
    }

    #[test]
    fn zero_window_rejected() {
        assert!(matches!(
            SlidingWindowCache::new(0, Arc::new(NoRotation)),
            Err(CacheError::ZeroWindow)
        ));
    }

    #[test]
    fn decode_steps_keep_last_window() {
        let mut cache = SlidingWindowCache::new(4, Arc::new(NoRotation)).unwrap();
        for pos in 0..10usize {
            cache.start_forward(&[pos]).unwrap();
            let (k, v) = kv(1);
            let view = cache.update(0, &k, &v).unwrap();
            let lo = (pos + 1).saturating_sub(4);
            assert_eq!(view.positions, (lo..=pos).collect::<Vec<_>>());
            assert_eq!(view.window, Some(4));
        }
        assert_eq!(cache.len(0), 4);
        assert_eq!(cache.next_position(), 10);
    }

    #[test]
    fn prefill_keeps_entries_needed_by_earliest_query() {
        let mut cache = SlidingWindowCache::new(3, Arc::new(NoRotation)).unwrap();
        cache.start_forward(&[0, 1, 2, 3, 4]).unwrap();
        let (k, v) = kv(5);
        cache.update(0, &k, &v).unwrap();
        assert_eq!(cache.len(0), 5);

        // query 5 sees 3, 4, 5
        cache.start_forward(&[5]).unwrap();
        assert_eq!(cache.positions(0), &[3, 4]);
    }

    #[test]
    fn empty_batch_evicts_nothing() {
        let mut cache = SlidingWindowCache::new(2, Arc::new(NoRotation)).unwrap();
        cache.start_forward(&[0, 1, 2]).unwrap();
        let (k, v) = kv(3);
        cache.update(0, &k, &v).unwrap();
        cache.start_forward(&[]).unwrap();
        assert_eq!(cache.len(0), 3);
    }
}
