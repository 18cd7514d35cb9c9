//! Interfaces of the components the core is built around but does not implement.
//!
//! - [`AttentionTransformer`] — the self-attention stack run over the
//!   interleaved sequence
//! - [`TextConditioner`] — text → condition embedding (e.g. a quantized CLAP)
//! - [`SemanticTokenizer`] — raw audio → semantic ids (e.g. HuBERT + k-means)
//! - [`AudioCodec`] — raw audio ↔ residual-quantized acoustic ids (e.g. EnCodec)
//!
//! Implementations are constructed elsewhere and injected as trait objects.
//! The pipeline shares the codec and semantic tokenizer between stages via
//! `Arc`, so the trait methods take `&self`.

use candle_core::Tensor;

use crate::Result;

/// Attention stack consumed by the token-conditioned transformer.
pub trait AttentionTransformer {
    /// Run the stack over `xs`.
    ///
    /// - `xs`: `[B, S, dim]` interleaved sequence embeddings
    /// - `self_attn_mask`: optional additive mask broadcastable to `[B, H, S, S]`
    ///   (0 = visible, large negative = masked)
    /// - `condition`: optional `[B, N_cond, dim]` condition, used for
    ///   cross-attention or as a self-attention prefix
    ///
    /// Must return `[B, S, dim]`.
    fn forward(
        &self,
        xs: &Tensor,
        self_attn_mask: Option<&Tensor>,
        condition: Option<&Tensor>,
    ) -> Result<Tensor>;
}

/// Produces condition embeddings from text prompts.
pub trait TextConditioner {
    /// Embed one prompt per batch row.
    ///
    /// Returns `[B, N_cond, condition_dim]` with `B = texts.len()`.
    fn embed_text(&self, texts: &[String]) -> Result<Tensor>;
}

/// Maps raw audio to semantic token ids.
pub trait SemanticTokenizer {
    /// `wave`: `[B, samples]` → `[B, N]` u32 ids in the semantic vocabulary.
    fn tokenize(&self, wave: &Tensor) -> Result<Tensor>;
}

/// Neural audio codec with residual vector quantization.
pub trait AudioCodec {
    /// `wave`: `[B, samples]` → `[B, frames, num_quantizers]` u32 codebook ids.
    fn encode(&self, wave: &Tensor) -> Result<Tensor>;

    /// `codes`: `[B, frames, Q]` u32 codebook ids → `[B, samples]` waveform.
    ///
    /// `Q` is the number of leading quantizers supplied (coarse only, or
    /// coarse + fine).
    fn decode(&self, codes: &Tensor) -> Result<Tensor>;
}
