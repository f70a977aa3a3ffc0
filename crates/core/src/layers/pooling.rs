use candle_core::{Result, Tensor, D};

/// One-dimensional average pooling over the last axis.
///
/// xs: `[batch, channels, length]` -> `[batch, channels, (length + 2 * pad - kernel) / stride + 1]`.
/// Padding is zero-filled and counted in the average.
pub fn avg_pool_1d(xs: &Tensor, kernel: usize, stride: usize, pad: usize) -> Result<Tensor> {
    let xs = if pad > 0 {
        xs.pad_with_zeros(D::Minus1, pad, pad)?
    } else {
        xs.clone()
    };
    let (batch, channels, length) = xs.dims3()?;
    if kernel == 0 || stride == 0 || kernel > length {
        candle_core::bail!("avg_pool_1d: kernel {kernel} / stride {stride} invalid for length {length}")
    }
    xs.reshape((batch, channels, 1, length))?
        .avg_pool2d_with_stride((1, kernel), (1, stride))?
        .squeeze(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn averages_non_overlapping_windows() {
        let values: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let xs = Tensor::from_vec(values, (1, 1, 8), &Device::Cpu).unwrap();
        let pooled = avg_pool_1d(&xs, 2, 2, 0).unwrap();
        assert_eq!(pooled.dims(), &[1, 1, 4]);
        let out: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(out, vec![0.5, 2.5, 4.5, 6.5]);
    }

    #[test]
    fn gemma3_patch_grid_pools_to_256() {
        // 64 x 64 patches, kernel = stride = 16
        let xs = Tensor::ones((1, 3, 4096), DType::F32, &Device::Cpu).unwrap();
        let pooled = avg_pool_1d(&xs, 16, 16, 0).unwrap();
        assert_eq!(pooled.dims(), &[1, 3, 256]);
    }

    #[test]
    fn zero_padding_counts_in_average() {
        let xs = Tensor::new(&[[[4f32, 4.0]]], &Device::Cpu).unwrap();
        let pooled = avg_pool_1d(&xs, 2, 2, 1).unwrap();
        let out: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(out, vec![2.0, 2.0]);
    }

    #[test]
    fn rejects_oversized_kernel() {
        let xs = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(avg_pool_1d(&xs, 8, 8, 0).is_err());
    }
}
