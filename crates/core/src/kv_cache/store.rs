//! Per-layer key/value storage shared by both cache regimes.

use std::sync::Arc;

use candle_core::Tensor;

use super::{CacheError, CacheView, RotationHook};

#[derive(Default)]
struct LayerEntries {
    key: Option<Tensor>,
    value: Option<Tensor>,
    positions: Vec<usize>,
}

impl LayerEntries {
    fn clear(&mut self) {
        self.key = None;
        self.value = None;
        self.positions.clear();
    }

    /// Keep entries `[start, len)`.
    fn keep_from(&mut self, start: usize) -> Result<(), CacheError> {
        let len = self.positions.len();
        if start == 0 {
            return Ok(());
        }
        if start >= len {
            self.clear();
            return Ok(());
        }
        if let (Some(k), Some(v)) = (&self.key, &self.value) {
            self.key = Some(k.narrow(2, start, len - start)?.contiguous()?);
            self.value = Some(v.narrow(2, start, len - start)?.contiguous()?);
        }
        self.positions.drain(..start);
        Ok(())
    }
}

pub(crate) struct LayerStore {
    layers: Vec<LayerEntries>,
    pending: Vec<usize>,
    next_position: usize,
    window: Option<usize>,
    hook: Arc<dyn RotationHook>,
}

impl LayerStore {
    pub(crate) fn new(window: Option<usize>, hook: Arc<dyn RotationHook>) -> Self {
        Self {
            layers: Vec::new(),
            pending: Vec::new(),
            next_position: 0,
            window,
            hook,
        }
    }

    pub(crate) fn start_forward(&mut self, positions: &[usize]) {
        self.pending = positions.to_vec();
        if let Some(&max) = positions.iter().max() {
            self.next_position = self.next_position.max(max + 1);
        }
    }

    pub(crate) fn next_position(&self) -> usize {
        self.next_position
    }

    pub(crate) fn len(&self, layer: usize) -> usize {
        self.layers.get(layer).map_or(0, |l| l.positions.len())
    }

    pub(crate) fn positions(&self, layer: usize) -> &[usize] {
        self.layers.get(layer).map_or(&[], |l| l.positions.as_slice())
    }

    pub(crate) fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Drop every entry whose position is below `threshold`. Returns the
    /// number of entries dropped across all layers.
    pub(crate) fn evict_below(&mut self, threshold: usize) -> Result<usize, CacheError> {
        let mut evicted = 0;
        for entries in &mut self.layers {
            let start = entries.positions.partition_point(|&p| p < threshold);
            evicted += start;
            entries.keep_from(start)?;
        }
        Ok(evicted)
    }

    /// Append `[1, kv_heads, t, head_dim]` entries for the pending positions.
    pub(crate) fn append(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<CacheView, CacheError> {
        let got = key.dim(2)?;
        if got != self.pending.len() {
            return Err(CacheError::BatchMismatch {
                layer,
                expected: self.pending.len(),
                got,
            });
        }
        if self.layers.len() <= layer {
            self.layers.resize_with(layer + 1, LayerEntries::default);
        }
        let entries = &mut self.layers[layer];

        let (k, v) = match (&entries.key, &entries.value) {
            (Some(k), Some(v)) => (Tensor::cat(&[k, key], 2)?, Tensor::cat(&[v, value], 2)?),
            _ => (key.contiguous()?, value.contiguous()?),
        };
        entries.key = Some(k.clone());
        entries.value = Some(v.clone());
        entries.positions.extend_from_slice(&self.pending);

        Ok(CacheView {
            key: k,
            value: v,
            positions: entries.positions.clone(),
            window: self.window,
        })
    }

    /// Remove positions `[begin, end)` and slide later entries down by
    /// `end - begin`, re-encoding their keys through the rotation hook.
    pub(crate) fn remove(&mut self, begin: usize, end: usize) -> Result<(), CacheError> {
        if begin > end || end > self.next_position {
            return Err(CacheError::InvalidRange {
                begin,
                end,
                committed: self.next_position,
            });
        }
        let delta = end - begin;
        if delta == 0 {
            return Ok(());
        }

        for (layer, entries) in self.layers.iter_mut().enumerate() {
            let (Some(k), Some(v)) = (&entries.key, &entries.value) else {
                continue;
            };
            let head = entries.positions.partition_point(|&p| p < begin);
            let tail = entries.positions.partition_point(|&p| p < end);
            let len = entries.positions.len();

            let mut keys = Vec::with_capacity(2);
            let mut values = Vec::with_capacity(2);
            if head > 0 {
                keys.push(k.narrow(2, 0, head)?);
                values.push(v.narrow(2, 0, head)?);
            }
            if tail < len {
                let shifted = self
                    .hook
                    .shift(layer, &k.narrow(2, tail, len - tail)?, -(delta as i64))?;
                keys.push(shifted);
                values.push(v.narrow(2, tail, len - tail)?);
            }

            let mut positions: Vec<usize> = entries.positions[..head].to_vec();
            positions.extend(entries.positions[tail..].iter().map(|&p| p - delta));

            if keys.is_empty() {
                entries.clear();
            } else {
                entries.key = Some(Tensor::cat(&keys, 2)?.contiguous()?);
                entries.value = Some(Tensor::cat(&values, 2)?.contiguous()?);
                entries.positions = positions;
            }
        }

        self.next_position -= delta;
        tracing::debug!(begin, end, "removed cache range");
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.layers.clear();
        self.pending.clear();
        self.next_position = 0;
    }
}
