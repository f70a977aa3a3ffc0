use std::sync::Arc;

use candle_core::Tensor;

use super::store::LayerStore;
use super::{CacheError, CacheView, KvCache, RotationHook};

/// Unbounded cache for full-attention layers. Retains every position.
pub struct CausalCache {
    store: LayerStore,
}

impl CausalCache {
    pub fn new(hook: Arc<dyn RotationHook>) -> Self {
        Self {
            store: LayerStore::new(None, hook),
        }
    }
}

impl KvCache for CausalCache {
    fn start_forward(&mut self, positions: &[usize]) -> Result<(), CacheError> {
        self.store.start_forward(positions);
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
        let k = Tensor::ones((1, 2, t, 4), DType::F32, &Device::Cpu).unwrap();
        (k.clone(), k)
    }

    #[test]
    fn retains_every_position() {
        let mut cache = CausalCache::new(Arc::new(NoRotation));
        let mut pos = 0;
        for chunk in [5usize, 3, 1, 1] {
            let positions: Vec<usize> = (pos..pos + chunk).collect();
            cache.start_forward(&positions).unwrap();
            let (k, v) = kv(chunk);
            let view = cache.update(0, &k, &v).unwrap();
            pos += chunk;
            assert_eq!(view.positions, (0..pos).collect::<Vec<_>>());
            assert_eq!(view.key.dims(), &[1, 2, pos, 4]);
            assert!(view.window.is_none());
        }
        assert_eq!(cache.len(0), 10);
        assert_eq!(cache.next_position(), 10);
    }

    #[test]
    fn update_rejects_batch_mismatch() {
        let mut cache = CausalCache::new(Arc::new(NoRotation));
        cache.start_forward(&[0, 1, 2]).unwrap();
        let (k, v) = kv(2);
        let err = cache.update(0, &k, &v).unwrap_err();
        assert!(matches!(
            err,
            CacheError::BatchMismatch {
                layer: 0,
                expected: 3,
                got: 2
            }
        ));
    }

    #[test]
    fn layers_are_independent() {
        let mut cache = CausalCache::new(Arc::new(NoRotation));
        cache.start_forward(&[0, 1]).unwrap();
        let (k, v) = kv(2);
        cache.update(2, &k, &v).unwrap();
        assert_eq!(cache.len(0), 0);
        assert_eq!(cache.len(2), 2);
    }
}
