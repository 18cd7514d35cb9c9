//! Coarse stage: semantic ids → first `Q_coarse` codec channels.

use std::sync::Arc;

use candle_core::{D, Tensor};

use super::{Generated, Prepared, StagePolicy};
use crate::config::TokenSequence;
use crate::model::collaborators::AudioCodec;
use crate::{Error, Result};

/// Input of the coarse stage.
#[derive(Debug, Clone)]
pub struct CoarseInput {
    /// Semantic ids `[B, N]`.
    pub semantic_ids: Tensor,
    /// Optional raw audio `[B, samples]` whose coarse codes seed generation.
    pub prime_wave: Option<Tensor>,
    /// Decode the coarse codes to a wave instead of returning them.
    pub reconstruct_wave: bool,
}

/// Decodes coarse acoustic ids, whole time steps at a time.
///
/// End-of-sequence may only be emitted on the last channel of a step, so a
/// stop always lands on a frame boundary.
pub struct CoarsePolicy {
    codec: Arc<dyn AudioCodec>,
}

impl CoarsePolicy {
    pub fn new(codec: Arc<dyn AudioCodec>) -> Self {
        Self { codec }
    }

    /// Leading coarse codes of `wave`, flattened step-major to `[B, frames * Q]`.
    fn prime_ids(&self, wave: &Tensor, target: &TokenSequence) -> Result<Tensor> {
        let codes = self.codec.encode(wave)?;
        let (b, frames, quantizers) = codes.dims3()?;
        let q = target.tokens_per_step;
        if quantizers < q {
            return Err(Error::Collaborator(format!(
                "codec produced {quantizers} quantizers, coarse stage needs {q}"
            )));
        }
        Ok(codes.narrow(D::Minus1, 0, q)?.contiguous()?.reshape((b, frames * q))?)
    }
}

impl StagePolicy for CoarsePolicy {
    type Input = CoarseInput;
    type Output = Generated;
    /// Whether to decode the result.
    type Carry = bool;
    const NAME: &'static str = "coarse";
    const NUM_SEQUENCES: usize = 2;

    fn prepare(&self, input: CoarseInput, target: &TokenSequence) -> Result<(Prepared, bool)> {
        let (batch_size, _) = input.semantic_ids.dims2()?;
        let target_len = target.time_steps() * target.tokens_per_step;
        if target_len == 0 {
            return Err(Error::config(format!(
                "coarse sequence_length {} is shorter than one step of {} tokens",
                target.sequence_length, target.tokens_per_step
            )));
        }

        let prime = match input.prime_wave.as_ref() {
            Some(wave) => {
                let prime = self.prime_ids(wave, target)?;
                // whole steps only, short of the target
                let steps = (prime.dim(1)? / target.tokens_per_step).min(target.time_steps());
                Some(prime.narrow(1, 0, steps * target.tokens_per_step)?)
            }
            None => None,
        };

        tracing::debug!(
            semantic_len = input.semantic_ids.dim(1)?,
            target_len,
            "prepared coarse stage"
        );

        let prepared = Prepared {
            batch_size,
            context: vec![input.semantic_ids],
            prime,
            target_len,
        };
        Ok((prepared, input.reconstruct_wave))
    }

    fn eos_allowed(&self, position: usize, target: &TokenSequence) -> bool {
        let q = target.tokens_per_step;
        position % q == q - 1
    }

    fn stop_on_eos(&self) -> bool {
        true
    }

    fn finish(
        &self,
        generated: Tensor,
        reconstruct_wave: bool,
        target: &TokenSequence,
    ) -> Result<Generated> {
        let (b, n) = generated.dims2()?;
        let q = target.tokens_per_step;
        let codes = generated.reshape((b, n / q, q))?;
        if !reconstruct_wave {
            return Ok(Generated::Tokens(codes));
        }
        let wave = super::decode_codes(self.codec.as_ref(), &codes, target.eos_id())?;
        Ok(Generated::Wave(wave))
    }
}
