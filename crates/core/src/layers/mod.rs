pub mod mask;
pub mod mlp;
pub mod norm;
pub mod pooling;
pub mod rotary;

pub use mask::position_mask;
pub use mlp::GeGluMlp;
pub use norm::GemmaRmsNorm;
pub use pooling::avg_pool_1d;
pub use rotary::RotaryEmbedding;

use candle_core::{Device, Tensor, WithDType};

use crate::error::ModelError;

/// Build a tensor from `values`, failing with a shape error when the element
/// count does not equal the product of `dims`.
pub fn checked_tensor<T: WithDType>(
    values: &[T],
    dims: &[usize],
    device: &Device,
) -> Result<Tensor, ModelError> {
    let expected: usize = dims.iter().product();
    if values.len() != expected {
        return Err(ModelError::Shape(format!(
            "{} values cannot fill dims {dims:?} ({expected} elements)",
            values.len()
        )));
    }
    Ok(Tensor::from_slice(values, dims, device)?)
}

/// Expand grouped KV heads to match the query head count.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> candle_core::Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_tensor_accepts_matching_len() {
        let t = checked_tensor(&[1u32, 2, 3, 4], &[2, 2], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 2]);
    }

    #[test]
    fn checked_tensor_accepts_empty() {
        let t = checked_tensor::<u32>(&[], &[0], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[0]);
    }

    #[test]
    fn checked_tensor_rejects_mismatch() {
        let err = checked_tensor(&[1f32, 2.0, 3.0], &[2, 2], &Device::Cpu).unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn repeat_kv_expands_heads() {
        let x = Tensor::zeros((1, 2, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = repeat_kv(x, 3).unwrap();
        assert_eq!(y.dims(), &[1, 6, 3, 4]);
    }
}
