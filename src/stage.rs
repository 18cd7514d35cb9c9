//! Autoregressive generation stages.
//!
//! Every stage wraps one [`TokenConditionedTransformer`] whose last token
//! sequence is the one being generated and whose earlier sequences are fixed
//! context. The decoding loop is shared; what differs per stage lives in a
//! [`StagePolicy`]:
//!
//! - [`semantic`] — text (+ optional prime wave) → semantic ids
//! - [`coarse`] — semantic ids → coarse acoustic ids or a decoded wave
//! - [`fine`] — coarse ids → fine acoustic ids and a decoded wave
//!
//! ## Decoding step
//!
//! ```text
//! generated: [g_0 .. g_{n-1}]  + placeholder
//!                 ↓ forward_with_cond_scale (final sequence only)
//! logits:    [l_0 .. l_{n-1}, l_n]
//!                                 ↑ prediction for g_n, sampled
//! ```
//!
//! The placeholder never influences `l_n` under a causal mask; it only makes
//! the final block long enough to expose that position.

pub mod coarse;
pub mod fine;
pub mod semantic;

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use rand_chacha::ChaCha8Rng;

use crate::config::{SamplingConfig, TokenSequence};
use crate::model::collaborators::{AudioCodec, TextConditioner};
use crate::model::token_conditioned::{ForwardOptions, TokenConditionedTransformer};
use crate::sampling;
use crate::{Error, Result};

/// Coarse/fine stage result.
#[derive(Debug, Clone)]
pub enum Generated {
    /// Token ids `[B, frames, Q]`.
    Tokens(Tensor),
    /// Decoded waveform `[B, samples]`.
    Wave(Tensor),
}

impl Generated {
    pub fn into_tensor(self) -> Tensor {
        match self {
            Generated::Tokens(t) | Generated::Wave(t) => t,
        }
    }
}

/// Decode `[B, frames, Q]` codec ids to a wave, mapping end-of-sequence to 0
/// first so the codec only sees valid codebook indices.
pub fn decode_codes(codec: &dyn AudioCodec, codes: &Tensor, eos: u32) -> Result<Tensor> {
    let codes = sampling::replace_eos(codes, eos)?;
    codec.decode(&codes)
}

/// Everything the decoding loop needs from a policy before the first step.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub batch_size: usize,
    /// Fixed context sequences `[B, N_k]`, one per non-generated sequence.
    pub context: Vec<Tensor>,
    /// Already-known leading ids of the generated sequence, `[B, P]`.
    pub prime: Option<Tensor>,
    /// Flattened length the generated sequence is decoded to.
    pub target_len: usize,
}

/// Stage-specific behaviour around the shared decoding loop.
pub trait StagePolicy {
    type Input;
    type Output;
    /// Whatever `prepare` hands on to `finish`.
    type Carry;

    /// Label used in logs and errors.
    const NAME: &'static str;

    /// Number of token sequences the wrapped transformer must have.
    const NUM_SEQUENCES: usize;

    /// Turn the stage input into context, prime and target length.
    fn prepare(
        &self,
        input: Self::Input,
        target: &TokenSequence,
    ) -> Result<(Prepared, Self::Carry)>;

    /// Whether end-of-sequence may be sampled at flattened `position`.
    fn eos_allowed(&self, _position: usize, _target: &TokenSequence) -> bool {
        true
    }

    /// Stop once every row has emitted end-of-sequence.
    fn stop_on_eos(&self) -> bool {
        false
    }

    /// Post-process the generated ids `[B, target_len]`.
    fn finish(
        &self,
        generated: Tensor,
        carry: Self::Carry,
        target: &TokenSequence,
    ) -> Result<Self::Output>;
}

/// One generation stage: a transformer, its sampling settings and a policy.
pub struct Stage<P: StagePolicy> {
    transformer: TokenConditionedTransformer,
    policy: P,
    sampling: SamplingConfig,
    conditioner: Option<Arc<dyn TextConditioner>>,
}

impl<P: StagePolicy> Stage<P> {
    pub fn new(
        transformer: TokenConditionedTransformer,
        policy: P,
        sampling: SamplingConfig,
        conditioner: Option<Arc<dyn TextConditioner>>,
    ) -> Result<Self> {
        sampling.validate()?;
        if !transformer.config().causal {
            return Err(Error::config(format!(
                "{} stage needs a causal transformer to decode step by step",
                P::NAME
            )));
        }
        let count = transformer.token_sequences().len();
        if count != P::NUM_SEQUENCES {
            return Err(Error::config(format!(
                "{} stage expects {} token sequences, got {count}",
                P::NAME,
                P::NUM_SEQUENCES
            )));
        }
        if transformer.has_condition() && conditioner.is_none() {
            return Err(Error::config(format!(
                "{} stage is conditioned but has no text conditioner",
                P::NAME
            )));
        }
        Ok(Self {
            transformer,
            policy,
            sampling,
            conditioner,
        })
    }

    pub fn has_condition(&self) -> bool {
        self.transformer.has_condition()
    }

    /// The sequence this stage generates.
    pub fn target(&self) -> &TokenSequence {
        let sequences = self.transformer.token_sequences();
        &sequences[sequences.len() - 1]
    }

    /// Embed `text` for a conditioned stage; `None` for unconditioned ones.
    fn condition(&self, text: Option<&[String]>, batch_size: usize) -> Result<Option<Tensor>> {
        let Some(conditioner) = self.conditioner.as_ref().filter(|_| self.has_condition()) else {
            return Ok(None);
        };
        let text = text.ok_or_else(|| {
            Error::precondition(format!("{} stage is conditioned and needs text", P::NAME))
        })?;
        if text.len() != batch_size {
            return Err(Error::precondition(format!(
                "{} stage got {} prompts for batch size {batch_size}",
                P::NAME,
                text.len()
            )));
        }
        let condition = conditioner.embed_text(text)?;
        Ok(Some(condition.to_device(self.transformer.device())?))
    }

    /// Run the stage end to end.
    pub fn generate(
        &self,
        input: P::Input,
        text: Option<&[String]>,
        rng: &mut ChaCha8Rng,
    ) -> Result<P::Output> {
        let target = self.target().clone();
        let (prepared, carry) = self.policy.prepare(input, &target)?;
        let condition = self.condition(text, prepared.batch_size)?;
        let generated = self.decode(&prepared, condition.as_ref(), &target, rng)?;
        self.policy.finish(generated, carry, &target)
    }

    /// The shared autoregressive loop. Returns `[B, target_len]` u32 ids.
    fn decode(
        &self,
        prepared: &Prepared,
        condition: Option<&Tensor>,
        target: &TokenSequence,
        rng: &mut ChaCha8Rng,
    ) -> Result<Tensor> {
        let device = self.transformer.device().clone();
        let batch = prepared.batch_size;
        let eos = target.eos_id();
        let target_len = prepared.target_len;

        let mut rows: Vec<Vec<u32>> = match &prepared.prime {
            Some(prime) => {
                if prime.dim(0)? != batch {
                    return Err(Error::precondition(format!(
                        "{} prime has batch {}, expected {batch}",
                        P::NAME,
                        prime.dim(0)?
                    )));
                }
                let mut rows: Vec<Vec<u32>> = prime
                    .to_device(&Device::Cpu)?
                    .to_dtype(DType::U32)?
                    .to_vec2()?;
                rows.iter_mut().for_each(|row| row.truncate(target_len));
                rows
            }
            None => vec![Vec::new(); batch],
        };
        let start = rows.first().map_or(0, Vec::len);

        let context: Vec<Tensor> = prepared
            .context
            .iter()
            .map(|t| t.to_device(&device))
            .collect::<candle_core::Result<_>>()?;

        tracing::info!(
            stage = P::NAME,
            batch,
            prime = start,
            target_len,
            "starting stage"
        );

        let opts = ForwardOptions {
            condition,
            return_only_final_seq_logits: true,
            ..Default::default()
        };

        for position in start..target_len {
            let flat: Vec<u32> = rows
                .iter()
                .flat_map(|row| row.iter().copied().chain(std::iter::once(eos)))
                .collect();
            let current = Tensor::from_vec(flat, (batch, position + 1), &device)?;

            let mut inputs = context.clone();
            inputs.push(current);
            let logits = self
                .transformer
                .forward_with_cond_scale(&inputs, opts, self.sampling.cond_scale)?
                .pop()
                .flatten()
                .ok_or_else(|| {
                    Error::precondition(format!("{} stage produced no logits", P::NAME))
                })?;

            // [B, N + 1, C] → [B, C] at the placeholder
            let mut logits = logits.narrow(1, position, 1)?.squeeze(1)?;
            if !self.policy.eos_allowed(position, target) {
                // eos is the last class
                logits = logits.narrow(1, 0, target.vocab_size)?;
            }

            let next: Vec<u32> = sampling::sample_next(&logits, &self.sampling, rng)?
                .to_device(&Device::Cpu)?
                .to_vec1()?;
            for (row, id) in rows.iter_mut().zip(next) {
                row.push(id);
            }

            if self.policy.stop_on_eos() && sampling::all_rows_have_eos(&rows, eos) {
                tracing::debug!(
                    stage = P::NAME,
                    position,
                    "every row emitted end-of-sequence, stopping early"
                );
                break;
            }
        }

        for row in rows.iter_mut() {
            row.resize(target_len, eos);
        }
        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        let generated = Tensor::from_vec(flat, (batch, target_len), &device)?;
        let generated = if self.policy.stop_on_eos() {
            sampling::mask_out_after_eos(&generated, eos)?
        } else {
            generated
        };

        tracing::info!(stage = P::NAME, len = target_len, "finished stage");
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use rand::SeedableRng;

    use super::*;
    use crate::config::TokenConditionedConfig;
    use crate::test_helpers::{
        CausalMeanTransformer, CountingTransformer, FakeTextConditioner, IdentityTransformer,
        eos_biased_core, random_core,
    };

    /// Generates a plain sequence with no context or post-processing.
    struct Plain {
        len: usize,
        batch: usize,
        stop: bool,
        prime: Option<Tensor>,
    }

    impl StagePolicy for Plain {
        type Input = ();
        type Output = Tensor;
        type Carry = ();
        const NAME: &'static str = "plain";
        const NUM_SEQUENCES: usize = 1;

        fn prepare(&self, _input: (), _target: &TokenSequence) -> Result<(Prepared, ())> {
            let prepared = Prepared {
                batch_size: self.batch,
                context: vec![],
                prime: self.prime.clone(),
                target_len: self.len,
            };
            Ok((prepared, ()))
        }

        fn eos_allowed(&self, _position: usize, _target: &TokenSequence) -> bool {
            self.stop
        }

        fn stop_on_eos(&self) -> bool {
            self.stop
        }

        fn finish(&self, generated: Tensor, _carry: (), _target: &TokenSequence) -> Result<Tensor> {
            Ok(generated)
        }
    }

    fn plain_stage(policy: Plain, conditioned: bool) -> (candle_nn::VarMap, Stage<Plain>) {
        let mut cfg =
            TokenConditionedConfig::new(vec![TokenSequence::new("semantic", 6, 1, 8)], 8);
        let conditioner: Option<Arc<dyn TextConditioner>> = if conditioned {
            cfg = cfg.with_condition(4);
            Some(Arc::new(FakeTextConditioner::new(2, 4)))
        } else {
            None
        };
        let (varmap, core) = random_core(&cfg, Box::new(CausalMeanTransformer));
        let stage = Stage::new(core, policy, SamplingConfig::default(), conditioner).unwrap();
        (varmap, stage)
    }

    #[test]
    fn test_generates_target_length() {
        let policy = Plain {
            len: 5,
            batch: 3,
            stop: false,
            prime: None,
        };
        let (_varmap, stage) = plain_stage(policy, false);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let out = stage.generate((), None, &mut rng).unwrap();
        assert_eq!(out.dims(), &[3, 5]);
        let rows: Vec<Vec<u32>> = out.to_vec2().unwrap();
        // eos is never sampled when disallowed
        assert!(rows.iter().flatten().all(|&id| id < 6));
    }

    #[test]
    fn test_prime_is_kept() {
        let prime = Tensor::new(&[[1u32, 2], [3, 4]], &Device::Cpu).unwrap();
        let policy = Plain {
            len: 4,
            batch: 2,
            stop: false,
            prime: Some(prime),
        };
        let (_varmap, stage) = plain_stage(policy, false);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let rows: Vec<Vec<u32>> = stage.generate((), None, &mut rng).unwrap().to_vec2().unwrap();
        assert_eq!(&rows[0][..2], &[1, 2]);
        assert_eq!(&rows[1][..2], &[3, 4]);
        assert_eq!(rows[0].len(), 4);
    }

    #[test]
    fn test_prime_batch_mismatch() {
        let prime = Tensor::zeros((3, 2), DType::U32, &Device::Cpu).unwrap();
        let policy = Plain {
            len: 4,
            batch: 2,
            stop: false,
            prime: Some(prime),
        };
        let (_varmap, stage) = plain_stage(policy, false);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = stage.generate((), None, &mut rng).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_seed_reproduces_output() {
        let make = || Plain {
            len: 6,
            batch: 2,
            stop: true,
            prime: None,
        };
        let (_varmap, stage) = plain_stage(make(), false);
        let a = stage
            .generate((), None, &mut ChaCha8Rng::seed_from_u64(11))
            .unwrap();
        let b = stage
            .generate((), None, &mut ChaCha8Rng::seed_from_u64(11))
            .unwrap();
        assert_eq!(a.to_vec2::<u32>().unwrap(), b.to_vec2::<u32>().unwrap());
    }

    #[test]
    fn test_stops_once_every_row_emits_eos() {
        let cfg = TokenConditionedConfig::new(vec![TokenSequence::new("semantic", 6, 1, 8)], 8);
        let (attention, calls) = CountingTransformer::new(Box::new(IdentityTransformer));
        let core = eos_biased_core(&cfg, Box::new(attention));
        let policy = Plain {
            len: 8,
            batch: 2,
            stop: true,
            prime: None,
        };
        let stage = Stage::new(core, policy, SamplingConfig::default(), None).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let rows: Vec<Vec<u32>> = stage.generate((), None, &mut rng).unwrap().to_vec2().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rows, vec![vec![6; 8], vec![6; 8]]);
    }

    #[test]
    fn test_eos_is_masked_out_when_disallowed() {
        let cfg = TokenConditionedConfig::new(vec![TokenSequence::new("semantic", 6, 1, 8)], 8);
        let (attention, calls) = CountingTransformer::new(Box::new(IdentityTransformer));
        let core = eos_biased_core(&cfg, Box::new(attention));
        let policy = Plain {
            len: 4,
            batch: 2,
            stop: false,
            prime: None,
        };
        let stage = Stage::new(core, policy, SamplingConfig::default(), None).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let rows: Vec<Vec<u32>> = stage.generate((), None, &mut rng).unwrap().to_vec2().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // remaining logits tie, top-k keeps the lowest id
        assert_eq!(rows, vec![vec![0; 4], vec![0; 4]]);
    }

    #[test]
    fn test_non_causal_transformer_is_config_error() {
        let mut cfg =
            TokenConditionedConfig::new(vec![TokenSequence::new("semantic", 6, 1, 8)], 8);
        cfg.causal = false;
        let (_varmap, core) = random_core(&cfg, Box::new(CausalMeanTransformer));
        let policy = Plain {
            len: 3,
            batch: 1,
            stop: false,
            prime: None,
        };
        let result = Stage::new(core, policy, SamplingConfig::default(), None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_conditioned_stage_requires_text() {
        let policy = Plain {
            len: 3,
            batch: 2,
            stop: false,
            prime: None,
        };
        let (_varmap, stage) = plain_stage(policy, true);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = stage.generate((), None, &mut rng).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let text = vec!["lofi".to_string(), "piano".to_string()];
        let out = stage.generate((), Some(&text), &mut rng).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
    }

    #[test]
    fn test_text_batch_mismatch() {
        let policy = Plain {
            len: 3,
            batch: 2,
            stop: false,
            prime: None,
        };
        let (_varmap, stage) = plain_stage(policy, true);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let text = vec!["only one".to_string()];
        let err = stage.generate((), Some(&text), &mut rng).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_conditioned_stage_without_conditioner_is_config_error() {
        let cfg = TokenConditionedConfig::new(vec![TokenSequence::new("semantic", 6, 1, 8)], 8)
            .with_condition(4);
        let (_varmap, core) = random_core(&cfg, Box::new(CausalMeanTransformer));
        let policy = Plain {
            len: 3,
            batch: 1,
            stop: false,
            prime: None,
        };
        let result = Stage::new(core, policy, SamplingConfig::default(), None);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
