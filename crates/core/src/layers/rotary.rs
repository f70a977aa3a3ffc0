use candle_core::{DType, Device, Result, Tensor};

/// Rotary position embedding with a precomputed sin/cos table.
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq_t = Tensor::from_slice(&inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq_t)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
            inv_freq,
        })
    }

    pub fn max_positions(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Apply RoPE with one position per token.
    /// q: [b, num_heads, t, head_dim], k: [b, num_kv_heads, t, head_dim], positions: u32 [t]
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        let cos = self.cos.index_select(positions, 0)?;
        let sin = self.sin.index_select(positions, 0)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }

    /// Rotate already-encoded keys by `delta` positions.
    ///
    /// RoPE rotations compose, so a key encoded at `p` becomes a key encoded
    /// at `p + delta`. x: [b, h, t, head_dim]
    pub fn rotate(&self, x: &Tensor, delta: i64) -> Result<Tensor> {
        let (_b, _h, seq_len, _d) = x.dims4()?;
        let half = self.inv_freq.len();
        let angles: Vec<f32> = self
            .inv_freq
            .iter()
            .map(|f| delta as f32 * f)
            .collect();
        let cos: Vec<f32> = angles.iter().map(|a| a.cos()).collect();
        let sin: Vec<f32> = angles.iter().map(|a| a.sin()).collect();
        let device = x.device();
        let cos = Tensor::from_vec(cos, (1, half), device)?
            .broadcast_as((seq_len, half))?
            .contiguous()?
            .to_dtype(x.dtype())?;
        let sin = Tensor::from_vec(sin, (1, half), device)?
            .broadcast_as((seq_len, half))?
            .contiguous()?
            .to_dtype(x.dtype())?;
        candle_nn::rotary_emb::rope(&x.contiguous()?, &cos, &sin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        let rope = RotaryEmbedding::new(64, 128, 10000.0, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(rope.sin.dims(), &[128, 32]);
        assert_eq!(rope.cos.dims(), &[128, 32]);
        assert_eq!(rope.max_positions(), 128);
    }

    #[test]
    fn apply_preserves_shape() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 64, 10000.0, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 4, 3, 16), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 2, 3, 16), &device).unwrap();
        let positions = Tensor::new(&[5u32, 6, 9], &device).unwrap();
        let (q2, k2) = rope.apply(&q, &k, &positions).unwrap();
        assert_eq!(q2.dims(), q.dims());
        assert_eq!(k2.dims(), k.dims());
    }

    #[test]
    fn rotate_composes_with_apply() {
        // encode at position 7 then shift by -3 == encode at position 4
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 32, 10000.0, DType::F32, &device).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 1, 1, 8), &device).unwrap();

        let at = |p: u32| {
            let pos = Tensor::new(&[p], &device).unwrap();
            rope.apply(&x, &x, &pos).unwrap().1
        };
        let shifted = rope.rotate(&at(7), -3).unwrap();
        let direct = at(4);

        let diff: f32 = (shifted - direct)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "max diff {diff}");
    }

    #[test]
    fn rotate_by_zero_is_identity() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 32, 10000.0, DType::F32, &device).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 2, 3, 8), &device).unwrap();
        let y = rope.rotate(&x, 0).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
