//! Per-sequence parameters: embedding table, start token and logit projection.
//!
//! A sequence with `Q = tokens_per_step` residual channels uses one flat table
//! of `(vocab_size + 1) * Q` rows. Channel `q` of every time step is shifted by
//! `q * vocab_size` before lookup so the same raw id embeds differently per
//! channel:
//!
//! ```text
//! raw ids:     [a0 a1 a2 a3 | b0 b1 b2 b3 | ...]      (Q = 4)
//! offsets:     [ 0  V 2V 3V |  0  V 2V 3V | ...]
//! ```
//!
//! On the way out, each channel position has its own projection
//! `[vocab_size + 1, dim]`, stacked as `logit_weights: [Q, vocab_size + 1, dim]`.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, Init, VarBuilder};

use crate::config::TokenSequence;
use crate::{Error, Result};

const PARAM_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 1.0,
};

/// Embedding, start token and per-channel logit projection for one token stream.
#[derive(Debug, Clone)]
pub struct SequenceEmbedder {
    sequence: TokenSequence,
    embedding: Embedding,
    /// [dim]
    start_token: Tensor,
    /// [Q, vocab_size + 1, dim]
    logit_weights: Tensor,
    dim: usize,
}

impl SequenceEmbedder {
    /// Create (or load) the parameters for `sequence` under `vb`.
    ///
    /// Weight names: `embedding.weight`, `start_token`, `logit_weights`.
    pub fn new(sequence: &TokenSequence, dim: usize, vb: VarBuilder) -> Result<Self> {
        sequence.validate()?;

        let vocab_with_eos = sequence.vocab_size_with_eos();
        let q = sequence.tokens_per_step;

        let embedding = candle_nn::embedding(vocab_with_eos * q, dim, vb.pp("embedding"))?;
        let start_token = vb.get_with_hints(dim, "start_token", PARAM_INIT)?;
        let logit_weights =
            vb.get_with_hints((q, vocab_with_eos, dim), "logit_weights", PARAM_INIT)?;

        Ok(Self {
            sequence: sequence.clone(),
            embedding,
            start_token,
            logit_weights,
            dim,
        })
    }

    pub fn sequence(&self) -> &TokenSequence {
        &self.sequence
    }

    /// Add the per-channel offset `(i % Q) * vocab_size` to flattened ids `[B, N]`.
    pub fn offset_ids(&self, ids: &Tensor) -> Result<Tensor> {
        let ids = ids.to_dtype(DType::U32)?;
        let q = self.sequence.tokens_per_step;
        if q == 1 {
            return Ok(ids);
        }

        let n = ids.dim(1)?;
        let vocab = self.sequence.vocab_size as u32;
        let offsets: Vec<u32> = (0..n).map(|i| (i % q) as u32 * vocab).collect();
        let offsets = Tensor::from_vec(offsets, (1, n), ids.device())?;
        Ok(ids.broadcast_add(&offsets)?)
    }

    /// Embed flattened raw ids `[B, N]` → `[B, N, dim]`.
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let ids = self.offset_ids(ids)?;
        Ok(self.embedding.forward(&ids)?)
    }

    /// The learned start token broadcast to `[B, 1, dim]`.
    pub fn start_tokens(&self, batch: usize) -> Result<Tensor> {
        Ok(self
            .start_token
            .reshape((1, 1, self.dim))?
            .broadcast_as((batch, 1, self.dim))?
            .contiguous()?)
    }

    /// Project hidden states `[B, N, dim]` → logits `[B, N, vocab_size + 1]`.
    ///
    /// Position `i` uses the projection of channel `i % Q`. A trailing partial
    /// step of `r < Q` positions uses the first `r` channel projections.
    pub fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let (b, n, d) = hidden.dims3()?;
        if d != self.dim {
            return Err(Error::precondition(format!(
                "hidden width {d} does not match model dim {} for sequence '{}'",
                self.dim,
                self.sequence.label()
            )));
        }

        let q = self.sequence.tokens_per_step;
        let c = self.sequence.vocab_size_with_eos();
        let nq = n / q * q;
        let remainder = n - nq;

        let mut parts = Vec::with_capacity(2);

        if nq > 0 {
            // [B, N/Q, Q, D] → [B, Q, N/Q, D]
            let grouped = hidden
                .narrow(1, 0, nq)?
                .reshape((b, nq / q, q, d))?
                .transpose(1, 2)?
                .contiguous()?;
            // [Q, C, D] → [1, Q, D, C]
            let weights = self.logit_weights.transpose(1, 2)?.contiguous()?.unsqueeze(0)?;
            // [B, Q, N/Q, C] → [B, N/Q, Q, C] → [B, N, C]
            let logits = grouped
                .broadcast_matmul(&weights)?
                .transpose(1, 2)?
                .reshape((b, nq, c))?;
            parts.push(logits);
        }

        if remainder > 0 {
            // [B, R, D] → [R, B, D]
            let rest = hidden.narrow(1, nq, remainder)?.transpose(0, 1)?.contiguous()?;
            // [R, C, D] → [R, D, C]
            let weights = self
                .logit_weights
                .narrow(0, 0, remainder)?
                .transpose(1, 2)?
                .contiguous()?;
            // [R, B, C] → [B, R, C]
            let logits = rest.matmul(&weights)?.transpose(0, 1)?.contiguous()?;
            parts.push(logits);
        }

        match parts.len() {
            0 => Ok(Tensor::zeros((b, 0, c), hidden.dtype(), hidden.device())?),
            1 => Ok(parts.remove(0)),
            _ => Ok(Tensor::cat(&parts, 1)?),
        }
    }
}
