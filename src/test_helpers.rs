//! Deterministic stand-ins for the injected collaborators.
//!
//! None of these are real models. They are just enough to drive the
//! transformer core and the stages on CPU with tiny shapes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::Result;
use crate::config::TokenConditionedConfig;
use crate::model::collaborators::{
    AttentionTransformer, AudioCodec, SemanticTokenizer, TextConditioner,
};
use crate::model::token_conditioned::TokenConditionedTransformer;

/// Core with randomly initialised parameters. Keep the `VarMap` alive.
pub fn random_core(
    cfg: &TokenConditionedConfig,
    transformer: Box<dyn AttentionTransformer>,
) -> (VarMap, TokenConditionedTransformer) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let core = TokenConditionedTransformer::new(cfg, transformer, vb).unwrap();
    (varmap, core)
}

/// Returns its input unchanged.
pub struct IdentityTransformer;

impl AttentionTransformer for IdentityTransformer {
    fn forward(
        &self,
        xs: &Tensor,
        _mask: Option<&Tensor>,
        _condition: Option<&Tensor>,
    ) -> Result<Tensor> {
        Ok(xs.clone())
    }
}

/// Core whose logits always favour end-of-sequence.
///
/// Embeddings and start tokens are all ones and only the end-of-sequence
/// class has non-zero logit weights, so every other class ties at zero.
/// Unconditioned configs only.
pub fn eos_biased_core(
    cfg: &TokenConditionedConfig,
    transformer: Box<dyn AttentionTransformer>,
) -> TokenConditionedTransformer {
    let dev = Device::Cpu;
    let mut tensors = HashMap::new();
    for (k, sequence) in cfg.token_sequences.iter().enumerate() {
        let q = sequence.tokens_per_step;
        let rows = sequence.vocab_size_with_eos() * q;
        tensors.insert(
            format!("sequences.{k}.embedding.weight"),
            Tensor::ones((rows, cfg.dim), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            format!("sequences.{k}.start_token"),
            Tensor::ones(cfg.dim, DType::F32, &dev).unwrap(),
        );
        let others = Tensor::zeros((q, sequence.vocab_size, cfg.dim), DType::F32, &dev).unwrap();
        let eos = Tensor::full(10f32, (q, 1, cfg.dim), &dev).unwrap();
        tensors.insert(
            format!("sequences.{k}.logit_weights"),
            Tensor::cat(&[&others, &eos], 1).unwrap(),
        );
    }
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
    TokenConditionedTransformer::new(cfg, transformer, vb).unwrap()
}

/// Forwards to another attention stack and counts the calls.
pub struct CountingTransformer {
    inner: Box<dyn AttentionTransformer>,
    calls: Arc<AtomicUsize>,
}

impl CountingTransformer {
    pub fn new(inner: Box<dyn AttentionTransformer>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = Self {
            inner,
            calls: calls.clone(),
        };
        (counting, calls)
    }
}

impl AttentionTransformer for CountingTransformer {
    fn forward(
        &self,
        xs: &Tensor,
        self_attn_mask: Option<&Tensor>,
        condition: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.forward(xs, self_attn_mask, condition)
    }
}

/// Uniform attention under the mask, plus a residual and the mean condition.
///
/// `out_i = x_i + mean_{j visible from i}(x_j) + mean(condition)`
pub struct CausalMeanTransformer;

impl AttentionTransformer for CausalMeanTransformer {
    fn forward(
        &self,
        xs: &Tensor,
        self_attn_mask: Option<&Tensor>,
        condition: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, s, _) = xs.dims3()?;
        let scores = match self_attn_mask {
            Some(mask) => mask.reshape((s, s))?.to_dtype(DType::F32)?,
            None => Tensor::zeros((s, s), DType::F32, xs.device())?,
        };
        let weights = candle_nn::ops::softmax_last_dim(&scores)?
            .to_dtype(xs.dtype())?
            .unsqueeze(0)?
            .broadcast_as((b, s, s))?
            .contiguous()?;
        let mut out = (xs + weights.matmul(&xs.contiguous()?)?)?;
        if let Some(condition) = condition {
            out = out.broadcast_add(&condition.mean_keepdim(1)?)?;
        }
        Ok(out)
    }
}

/// Hashes each prompt into a fixed `[n_cond, dim]` embedding.
pub struct FakeTextConditioner {
    n_cond: usize,
    dim: usize,
}

impl FakeTextConditioner {
    pub fn new(n_cond: usize, dim: usize) -> Self {
        Self { n_cond, dim }
    }
}

impl TextConditioner for FakeTextConditioner {
    fn embed_text(&self, texts: &[String]) -> Result<Tensor> {
        let mut data = Vec::with_capacity(texts.len() * self.n_cond * self.dim);
        for text in texts {
            let seed: usize = text.bytes().map(usize::from).sum();
            for k in 0..self.n_cond {
                for d in 0..self.dim {
                    data.push(((seed + 31 * k + 7 * d) % 17) as f32 / 17.0 - 0.5);
                }
            }
        }
        Ok(Tensor::from_vec(
            data,
            (texts.len(), self.n_cond, self.dim),
            &Device::Cpu,
        )?)
    }
}

/// Per-frame amplitude of `[B, samples]` audio, quantised to an integer.
fn frame_levels(wave: &Tensor, hop: usize) -> Result<Vec<Vec<u32>>> {
    let (b, samples) = wave.dims2()?;
    let frames = samples / hop;
    let levels = wave
        .to_dtype(DType::F32)?
        .narrow(1, 0, frames * hop)?
        .reshape((b, frames, hop))?
        .abs()?
        .mean(D::Minus1)?
        .affine(1000.0, 0.0)?
        .round()?
        .to_dtype(DType::U32)?
        .to_vec2()?;
    Ok(levels)
}

/// One semantic id per `hop` samples, derived from the frame amplitude.
pub struct FakeSemanticTokenizer {
    vocab_size: u32,
    hop: usize,
}

impl FakeSemanticTokenizer {
    pub fn new(vocab_size: u32, hop: usize) -> Self {
        Self { vocab_size, hop }
    }
}

impl SemanticTokenizer for FakeSemanticTokenizer {
    fn tokenize(&self, wave: &Tensor) -> Result<Tensor> {
        let levels = frame_levels(wave, self.hop)?;
        let (b, n) = (levels.len(), levels.first().map_or(0, Vec::len));
        let ids: Vec<u32> = levels
            .into_iter()
            .flatten()
            .map(|l| l % self.vocab_size)
            .collect();
        Ok(Tensor::from_vec(ids, (b, n), &Device::Cpu)?)
    }
}

/// Codec with `hop` samples per frame. Quantizer `q` of a frame holds
/// `(level + q) % vocab`; decoding writes quantizer 0 back out as a level.
pub struct FakeCodec {
    vocab_size: u32,
    quantizers: usize,
    hop: usize,
}

impl FakeCodec {
    pub fn new(vocab_size: u32, quantizers: usize, hop: usize) -> Self {
        Self {
            vocab_size,
            quantizers,
            hop,
        }
    }
}

impl AudioCodec for FakeCodec {
    fn encode(&self, wave: &Tensor) -> Result<Tensor> {
        let levels = frame_levels(wave, self.hop)?;
        let (b, frames) = (levels.len(), levels.first().map_or(0, Vec::len));
        let codes: Vec<u32> = levels
            .into_iter()
            .flatten()
            .flat_map(|l| (0..self.quantizers as u32).map(move |q| (l + q) % self.vocab_size))
            .collect();
        Ok(Tensor::from_vec(codes, (b, frames, self.quantizers), &Device::Cpu)?)
    }

    fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        let (b, frames, _) = codes.dims3()?;
        let level = codes
            .narrow(D::Minus1, 0, 1)?
            .to_dtype(DType::F32)?
            .affine(1.0 / self.vocab_size as f64, 0.0)?;
        Ok(level
            .broadcast_as((b, frames, self.hop))?
            .reshape((b, frames * self.hop))?)
    }
}
