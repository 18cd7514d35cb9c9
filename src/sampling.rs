//! Token sampling and end-of-sequence bookkeeping.
//!
//! Sampling runs host-side on `[B, C]` logits: the per-step vocabulary is small
//! and the batch loop is sequential anyway. Randomness comes from a caller-owned
//! [`ChaCha8Rng`] so a seed reproduces a generation.

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::Result;
use crate::config::SamplingConfig;

/// Pull `[B, C]` logits to host memory as f32 rows.
fn host_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(logits
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec2()?)
}

/// Number of logits kept by [`top_k`] for a vocabulary of `classes`.
pub fn top_k_count(classes: usize, filter_thres: f64) -> usize {
    let k = ((1.0 - filter_thres) * classes as f64).ceil() as usize;
    k.clamp(1, classes.max(1))
}

/// Keep the `ceil((1 - filter_thres) * C)` largest logits per row, set the
/// rest to `-inf`. Ties at the cut keep the lower index.
pub fn top_k(logits: &Tensor, filter_thres: f64) -> Result<Tensor> {
    let (b, c) = logits.dims2()?;
    let k = top_k_count(c, filter_thres);
    let rows = host_rows(logits)?;

    let mut filtered = Vec::with_capacity(b * c);
    for row in rows {
        let mut order: Vec<usize> = (0..c).collect();
        order.sort_by(|&i, &j| row[j].total_cmp(&row[i]).then(i.cmp(&j)));
        let mut out = vec![f32::NEG_INFINITY; c];
        for &i in &order[..k] {
            out[i] = row[i];
        }
        filtered.extend(out);
    }

    Ok(Tensor::from_vec(filtered, (b, c), logits.device())?.to_dtype(logits.dtype())?)
}

fn argmax(row: &[f32]) -> u32 {
    let mut best = 0;
    for (i, v) in row.iter().enumerate() {
        if *v > row[best] {
            best = i;
        }
    }
    best as u32
}

/// Draw one id per row as `argmax(logits / temperature + gumbel_noise)`.
///
/// `temperature <= 0` is greedy decoding.
pub fn gumbel_sample(logits: &Tensor, temperature: f64, rng: &mut ChaCha8Rng) -> Result<Vec<u32>> {
    let rows = host_rows(logits)?;
    if temperature <= 0.0 {
        return Ok(rows.iter().map(|row| argmax(row)).collect());
    }

    Ok(rows
        .iter()
        .map(|row| {
            let noisy: Vec<f32> = row
                .iter()
                .map(|&l| {
                    let u: f64 = rng.random::<f64>().clamp(1e-20, 1.0 - 1e-12);
                    let gumbel = -(-u.ln()).ln();
                    (l as f64 / temperature + gumbel) as f32
                })
                .collect();
            argmax(&noisy)
        })
        .collect())
}

/// Top-k filter then gumbel-sample `[B, C]` logits → `[B]` u32 ids.
pub fn sample_next(logits: &Tensor, cfg: &SamplingConfig, rng: &mut ChaCha8Rng) -> Result<Tensor> {
    let filtered = top_k(logits, cfg.filter_thres)?;
    let ids = gumbel_sample(&filtered, cfg.temperature, rng)?;
    let n = ids.len();
    Ok(Tensor::from_vec(ids, n, logits.device())?)
}

/// Whether every host-side row of ids contains `eos`.
pub fn all_rows_have_eos(rows: &[Vec<u32>], eos: u32) -> bool {
    rows.iter().all(|row| row.contains(&eos))
}

/// Overwrite every position after the first `eos` of each row with `eos`.
pub fn mask_out_after_eos(ids: &Tensor, eos: u32) -> Result<Tensor> {
    let (b, n) = ids.dims2()?;
    let rows: Vec<Vec<u32>> = ids.to_dtype(DType::U32)?.to_vec2()?;
    let mut out = Vec::with_capacity(b * n);
    for row in rows {
        let mut seen = false;
        out.extend(row.into_iter().map(|id| {
            if seen {
                return eos;
            }
            seen = id == eos;
            id
        }));
    }
    Ok(Tensor::from_vec(out, (b, n), ids.device())?)
}

/// Replace every `eos` with `0`, e.g. before handing codes to a codec.
pub fn replace_eos(ids: &Tensor, eos: u32) -> Result<Tensor> {
    let eos_t = Tensor::full(eos, ids.shape(), ids.device())?;
    let zeros = ids.zeros_like()?;
    Ok(ids.eq(&eos_t)?.where_cond(&zeros, ids)?)
}

/// Collapse runs of repeated ids in each row of `[B, N]`, then trim every row
/// to the shortest result.
pub fn unique_consecutive(ids: &Tensor) -> Result<Tensor> {
    let (b, _) = ids.dims2()?;
    let rows: Vec<Vec<u32>> = ids.to_dtype(DType::U32)?.to_vec2()?;
    let deduped: Vec<Vec<u32>> = rows
        .into_iter()
        .map(|mut row| {
            row.dedup();
            row
        })
        .collect();
    let len = deduped.iter().map(Vec::len).min().unwrap_or(0);
    let flat: Vec<u32> = deduped
        .iter()
        .flat_map(|row| row[..len].iter().copied())
        .collect();
    Ok(Tensor::from_vec(flat, (b, len), ids.device())?)
}
