use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

/// Gemma-flavoured RMSNorm: `x / rms(x) * (1 + weight)`.
pub struct GemmaRmsNorm {
    weight: Tensor,
    eps: f64,
}

impl GemmaRmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        Ok(Self { weight, eps })
    }

    /// Normalize with an epsilon chosen by the caller instead of the stored one.
    pub fn forward_with_eps(&self, xs: &Tensor, eps: f64) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let xs_normed = xs.broadcast_div(&(variance + eps)?.sqrt()?)?;
        let scale = (&self.weight.to_dtype(DType::F32)? + 1.0)?;
        xs_normed.broadcast_mul(&scale)?.to_dtype(dtype)
    }
}

impl Module for GemmaRmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_with_eps(xs, self.eps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn zero_weight_gives_unit_rms() {
        let device = Device::Cpu;
        let norm = GemmaRmsNorm::new(4, 1e-6, VarBuilder::zeros(DType::F32, &device)).unwrap();
        let xs = Tensor::new(&[[2f32, -2.0, 2.0, -2.0]], &device).unwrap();
        let out: Vec<Vec<f32>> = norm.forward(&xs).unwrap().to_vec2().unwrap();
        for v in &out[0] {
            assert!((v.abs() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn large_eps_shrinks_output() {
        let device = Device::Cpu;
        let norm = GemmaRmsNorm::new(2, 1e-6, VarBuilder::zeros(DType::F32, &device)).unwrap();
        let xs = Tensor::new(&[[1f32, 1.0]], &device).unwrap();
        let out: Vec<Vec<f32>> = norm.forward_with_eps(&xs, 3.0).unwrap().to_vec2().unwrap();
        // 1 / sqrt(1 + 3) = 0.5
        assert!((out[0][0] - 0.5).abs() < 1e-6);
    }
}
