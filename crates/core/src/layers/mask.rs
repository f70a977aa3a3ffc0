use candle_core::{DType, Device, Result, Tensor};

/// Additive attention mask over explicit positions.
///
/// Query `i` may attend key `j` when `key_positions[j] <= query_positions[i]`
/// and, with a window, `query_positions[i] - key_positions[j] < window`.
/// Returns `[1, 1, q_len, kv_len]`.
pub fn position_mask(
    query_positions: &[usize],
    key_positions: &[usize],
    window: Option<usize>,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let q_len = query_positions.len();
    let kv_len = key_positions.len();
    let mut mask = vec![f32::NEG_INFINITY; q_len * kv_len];

    for (i, &q_pos) in query_positions.iter().enumerate() {
        for (j, &k_pos) in key_positions.iter().enumerate() {
            let visible = k_pos <= q_pos && window.is_none_or(|w| q_pos - k_pos < w);
            if visible {
                mask[i * kv_len + j] = 0.0;
            }
        }
    }

    Tensor::from_vec(mask, (1, 1, q_len, kv_len), device)?.to_dtype(dtype)
}
