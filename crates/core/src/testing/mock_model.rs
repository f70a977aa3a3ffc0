use std::sync::{Arc, Mutex};

use candle_core::{DType, Result, Tensor};

use crate::error::ModelError;
use crate::kv_cache::{AttentionKind, CausalCache, DualCache, NoRotation, SlidingWindowCache};
use crate::models::TextDecoder;
use crate::multimodal::VisionEncoder;

/// Vision tower stand-in: each patch embeds as the mean of its pixels per
/// channel, so `hidden_size == channels`. Deterministic and weight-free.
pub struct MockVisionEncoder {
    patch_size: usize,
    channels: usize,
}

impl MockVisionEncoder {
    pub fn new(patch_size: usize, channels: usize) -> Self {
        Self {
            patch_size,
            channels,
        }
    }
}

impl VisionEncoder for MockVisionEncoder {
    fn forward(&self, pixels: &Tensor, _positions: &Tensor) -> Result<Tensor> {
        pixels
            .avg_pool2d(self.patch_size)?
            .flatten(2, 3)?
            .transpose(1, 2)?
            .contiguous()
    }

    fn hidden_size(&self) -> usize {
        self.channels
    }
}

/// What the decoder saw on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderCall {
    pub inputs: Vec<u32>,
    pub positions: Vec<u32>,
    pub outputs: Vec<u32>,
    pub embedding_dims: Option<Vec<usize>>,
    /// Visible cache positions per layer after the update.
    pub visible: Vec<Vec<usize>>,
}

/// Decoder stand-in that drives the cache like a real model (one
/// `[1, 1, t, 1]` entry per layer) and records every call. Returns zero
/// logits of the right shape.
pub struct RecordingDecoder {
    kinds: Vec<AttentionKind>,
    vocab_size: usize,
    calls: Arc<Mutex<Vec<DecoderCall>>>,
}

impl RecordingDecoder {
    pub fn new(kinds: Vec<AttentionKind>, vocab_size: usize) -> Self {
        Self {
            kinds,
            vocab_size,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Cache with this decoder's layer table and the identity rotation hook.
    pub fn new_cache(&self, sliding_window: usize) -> DualCache {
        let hook = Arc::new(NoRotation);
        DualCache::new(
            SlidingWindowCache::new(sliding_window, hook.clone())
                .expect("sliding window must be positive"),
            CausalCache::new(hook),
            self.kinds.clone(),
        )
    }

    /// Handle to the recorded calls that outlives a move into a model.
    pub fn calls(&self) -> Arc<Mutex<Vec<DecoderCall>>> {
        self.calls.clone()
    }
}

impl TextDecoder for RecordingDecoder {
    fn forward(
        &self,
        inputs: &Tensor,
        positions: &Tensor,
        embeddings: Option<&Tensor>,
        outputs: &Tensor,
        cache: &mut DualCache,
    ) -> std::result::Result<Tensor, ModelError> {
        let position_values = positions.to_vec1::<u32>()?;
        let query: Vec<usize> = position_values.iter().map(|&p| p as usize).collect();
        cache.start_forward(&query)?;

        let device = inputs.device().clone();
        let entries: Vec<f32> = query.iter().map(|&p| p as f32).collect();
        let kv = Tensor::from_vec(entries, (1, 1, query.len(), 1), &device)?;

        let mut visible = Vec::with_capacity(self.kinds.len());
        for layer in 0..self.kinds.len() {
            let view = cache.update(layer, &kv, &kv)?;
            let last = query.iter().max().copied().unwrap_or(0);
            visible.push(
                view.positions
                    .iter()
                    .copied()
                    .filter(|&p| p <= last && view.window.is_none_or(|w| last - p < w))
                    .collect(),
            );
        }

        let output_values = outputs.to_vec1::<u32>()?;
        let call = DecoderCall {
            inputs: inputs.to_vec1::<u32>()?,
            positions: position_values,
            outputs: output_values.clone(),
            embedding_dims: embeddings.map(|e| e.dims().to_vec()),
            visible,
        };
        self.calls
            .lock()
            .map_err(|_| ModelError::Shape("recorder lock poisoned".into()))?
            .push(call);

        Ok(Tensor::zeros(
            (output_values.len(), self.vocab_size),
            DType::F32,
            &device,
        )?)
    }

    fn attention_kind(&self, layer: usize) -> Option<AttentionKind> {
        self.kinds.get(layer).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn mock_vision_encoder_shape() {
        let encoder = MockVisionEncoder::new(7, 3);
        let pixels = Tensor::ones((1, 3, 28, 28), DType::F32, &Device::Cpu).unwrap();
        let positions = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        let out = encoder.forward(&pixels, &positions).unwrap();
        assert_eq!(out.dims(), &[1, 16, 3]);
    }

    #[test]
    fn recording_decoder_records_calls() {
        let decoder =
            RecordingDecoder::new(vec![AttentionKind::SlidingWindow, AttentionKind::Causal], 8);
        let mut cache = decoder.new_cache(2);
        let calls = decoder.calls();

        let t = |v: &[u32]| Tensor::new(v, &Device::Cpu).unwrap();
        let logits = decoder
            .forward(&t(&[4, 5, 6]), &t(&[0, 1, 2]), None, &t(&[2]), &mut cache)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 8]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].inputs, vec![4, 5, 6]);
        assert_eq!(calls[0].visible[0], vec![1, 2]);
        assert_eq!(calls[0].visible[1], vec![0, 1, 2]);
    }
}
