//! Generic multi-sequence transformer.
//!
//! Handles any number of token streams, each with its own vocabulary size,
//! channels per step and length, around an injected attention stack:
//!
//! ```text
//! ids_1 ─ offset ─ embed ──┐
//! ids_2 ─ offset ─ embed ──┼→ [s1, e1.., s2, e2.., ...] → attention → split
//!   ...                    ┘                                             │
//!                     logits_1, logits_2, ... ← per-channel projection ←─┘
//! ```
//!
//! For a block `[s_k, t_0, .., t_{n-1}]` the hidden states at
//! `[s_k, t_0, .., t_{n-2}]` are kept, so logit `i` of sequence `k` is the
//! prediction for token `i` given everything before it. The output at
//! `t_{n-1}` only feeds the following blocks.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};

use super::collaborators::AttentionTransformer;
use super::embedding::SequenceEmbedder;
use super::mask::causal_mask;
use crate::config::{TokenConditionedConfig, TokenSequence};
use crate::{Error, Result};

/// Per-call options for [`TokenConditionedTransformer::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions<'a> {
    /// Additive self-attention mask over the combined sequence. When `None`
    /// and the model is causal, a causal mask is built.
    pub self_attn_mask: Option<&'a Tensor>,
    /// Condition embedding `[B, N_cond, condition_dim]`.
    pub condition: Option<&'a Tensor>,
    /// Overrides the configured condition drop probability.
    pub cond_drop_prob: Option<f64>,
    /// Only project the last sequence; earlier entries come back as `None`.
    pub return_only_final_seq_logits: bool,
}

/// Multi-sequence transformer core.
pub struct TokenConditionedTransformer {
    sequences: Vec<SequenceEmbedder>,
    transformer: Box<dyn AttentionTransformer>,
    /// Projects the condition to `dim` when its width differs.
    condition_proj: Option<candle_nn::Linear>,
    /// [1, 1, dim], substituted for dropped conditions.
    null_condition_emb: Option<Tensor>,
    cfg: TokenConditionedConfig,
    device: Device,
    dtype: DType,
}

impl TokenConditionedTransformer {
    /// Build the core around `transformer`.
    ///
    /// Weight names: `sequences.{k}.*` (see [`SequenceEmbedder`]) and, for
    /// conditioned models, `null_condition_emb` and `condition_proj.*`.
    pub fn new(
        cfg: &TokenConditionedConfig,
        transformer: Box<dyn AttentionTransformer>,
        vb: VarBuilder,
    ) -> Result<Self> {
        cfg.validate()?;

        let vb_seq = vb.pp("sequences");
        let sequences = cfg
            .token_sequences
            .iter()
            .enumerate()
            .map(|(k, sequence)| SequenceEmbedder::new(sequence, cfg.dim, vb_seq.pp(k)))
            .collect::<Result<Vec<_>>>()?;

        let (condition_proj, null_condition_emb) = if cfg.has_condition {
            let proj = if cfg.condition_dim() != cfg.dim {
                Some(candle_nn::linear(
                    cfg.condition_dim(),
                    cfg.dim,
                    vb.pp("condition_proj"),
                )?)
            } else {
                None
            };
            let null = vb.get_with_hints(
                (1, 1, cfg.dim),
                "null_condition_emb",
                Init::Randn {
                    mean: 0.0,
                    stdev: 1.0,
                },
            )?;
            (proj, Some(null))
        } else {
            (None, None)
        };

        tracing::debug!(
            sequences = ?cfg.token_sequences.iter().map(|s| s.label()).collect::<Vec<_>>(),
            dim = cfg.dim,
            has_condition = cfg.has_condition,
            "built token-conditioned transformer"
        );

        Ok(Self {
            sequences,
            transformer,
            condition_proj,
            null_condition_emb,
            cfg: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn config(&self) -> &TokenConditionedConfig {
        &self.cfg
    }

    pub fn token_sequences(&self) -> &[TokenSequence] {
        &self.cfg.token_sequences
    }

    pub fn has_condition(&self) -> bool {
        self.cfg.has_condition
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Flatten one input to `[B, N]` u32.
    ///
    /// Accepts `[B, N]` or `[B, Q, T]`; the latter is flattened step-major
    /// (all channels of step 0, then step 1, ...).
    fn flatten_ids(&self, index: usize, ids: &Tensor) -> Result<Tensor> {
        let sequence = &self.cfg.token_sequences[index];
        let ids = match ids.rank() {
            2 => ids.clone(),
            3 => {
                let (b, q, t) = ids.dims3()?;
                if q != sequence.tokens_per_step {
                    return Err(Error::precondition(format!(
                        "sequence '{}' expects {} channels per step, got input {:?}",
                        sequence.label(),
                        sequence.tokens_per_step,
                        ids.dims()
                    )));
                }
                ids.transpose(1, 2)?.contiguous()?.reshape((b, t * q))?
            }
            _ => {
                return Err(Error::precondition(format!(
                    "sequence '{}' ids must be [B, N] or [B, Q, T], got {:?}",
                    sequence.label(),
                    ids.dims()
                )));
            }
        };
        if ids.dim(1)? == 0 {
            return Err(Error::precondition(format!(
                "sequence '{}' is empty",
                sequence.label()
            )));
        }
        Ok(ids)
    }

    /// Resolve the condition actually fed to the attention stack.
    ///
    /// Rows are replaced by the null condition with probability `drop_prob`.
    /// A conditioned model called without a condition gets the null condition
    /// for every row.
    fn prepare_condition(
        &self,
        condition: Option<&Tensor>,
        drop_prob: f64,
        batch: usize,
    ) -> Result<Option<Tensor>> {
        let Some(null) = self.null_condition_emb.as_ref() else {
            if condition.is_some() {
                tracing::debug!("condition passed to an unconditioned model, ignoring");
            }
            return Ok(None);
        };

        let dim = self.cfg.dim;
        let condition = match condition {
            Some(condition) if drop_prob < 1.0 => condition,
            _ => return Ok(Some(null.broadcast_as((batch, 1, dim))?.contiguous()?)),
        };

        let (cb, n_cond, width) = condition.dims3()?;
        if cb != batch || width != self.cfg.condition_dim() {
            return Err(Error::precondition(format!(
                "condition must be [{batch}, N, {}], got {:?}",
                self.cfg.condition_dim(),
                condition.dims()
            )));
        }

        let condition = condition.to_dtype(self.dtype)?;
        let condition = match &self.condition_proj {
            Some(proj) => condition.apply(proj)?,
            None => condition,
        };

        if drop_prob <= 0.0 {
            return Ok(Some(condition));
        }

        // keep[b] = u[b] >= drop_prob, broadcast over [N, D]
        let keep = Tensor::rand(0f32, 1f32, (batch, 1, 1), condition.device())?
            .ge(drop_prob)?
            .broadcast_as((batch, n_cond, dim))?;
        let null = null.broadcast_as((batch, n_cond, dim))?;
        Ok(Some(keep.where_cond(&condition, &null)?))
    }

    /// Compute per-sequence logits.
    ///
    /// `all_token_ids` holds one tensor per configured sequence, in order.
    /// Returns one entry per sequence with shape `[B, N_k, vocab_k + 1]`, or
    /// `None` for sequences skipped by `return_only_final_seq_logits`.
    pub fn forward(
        &self,
        all_token_ids: &[Tensor],
        opts: ForwardOptions<'_>,
    ) -> Result<Vec<Option<Tensor>>> {
        let expected = self.sequences.len();
        if all_token_ids.len() != expected {
            return Err(Error::precondition(format!(
                "expected {expected} token sequences, got {}",
                all_token_ids.len()
            )));
        }

        let batch = all_token_ids[0].dim(0)?;

        // 1-4. offset + embed + start tokens, interleaved
        let mut blocks = Vec::with_capacity(2 * expected);
        let mut lengths = Vec::with_capacity(expected);
        for (index, (ids, embedder)) in all_token_ids.iter().zip(&self.sequences).enumerate() {
            let ids = self.flatten_ids(index, ids)?;
            if ids.dim(0)? != batch {
                return Err(Error::precondition(format!(
                    "sequence '{}' has batch {}, expected {batch}",
                    embedder.sequence().label(),
                    ids.dim(0)?
                )));
            }
            let ids = ids.to_device(&self.device)?;
            lengths.push(ids.dim(1)?);
            blocks.push(embedder.start_tokens(batch)?);
            blocks.push(embedder.embed(&ids)?);
        }
        let xs = Tensor::cat(&blocks, 1)?;
        let total_len = xs.dim(1)?;

        // 5. attention
        let built_mask = match opts.self_attn_mask {
            None if self.cfg.causal => Some(causal_mask(total_len, self.dtype, &self.device)?),
            _ => None,
        };
        let mask = opts.self_attn_mask.or(built_mask.as_ref());
        let drop_prob = opts.cond_drop_prob.unwrap_or(self.cfg.cond_drop_prob);
        let condition = self.prepare_condition(opts.condition, drop_prob, batch)?;

        let hidden = self
            .transformer
            .forward(&xs, mask, condition.as_ref())?;
        if hidden.dims() != xs.dims() {
            return Err(Error::Collaborator(format!(
                "attention transformer changed shape {:?} → {:?}",
                xs.dims(),
                hidden.dims()
            )));
        }

        // 6-7. split per block and project
        let last = expected - 1;
        let mut offset = 0;
        let mut all_logits = Vec::with_capacity(expected);
        for (index, (embedder, &n)) in self.sequences.iter().zip(&lengths).enumerate() {
            let block_start = offset;
            offset += n + 1;
            if opts.return_only_final_seq_logits && index != last {
                all_logits.push(None);
                continue;
            }
            let segment = hidden.narrow(1, block_start, n)?;
            all_logits.push(Some(embedder.logits(&segment)?));
        }

        Ok(all_logits)
    }
}
