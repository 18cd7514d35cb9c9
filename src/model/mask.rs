//! Additive self-attention masks for the interleaved sequence.
//!
//! Masks are 4D `[1, 1, S, S]` with 0.0 for visible positions and the dtype's
//! minimum for masked ones, so they can be added to attention scores directly.

use candle_core::{DType, Device, Result, Tensor};

/// Most negative finite value representable in `dtype`.
pub fn mask_min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Create a causal mask `[1, 1, seq_len, seq_len]`: position `i` sees `j <= i`.
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let min_val = mask_min_value(dtype);
    let mask_data: Vec<f64> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { min_val } else { 0.0 }))
        .collect();

    Tensor::new(mask_data.as_slice(), device)?
        .reshape((1, 1, seq_len, seq_len))?
        .to_dtype(dtype)
}
