//! Fine stage: coarse ids → remaining codec channels, decoded to a wave.
//!
//! Coarse and fine ids come from the same codec, so both share one vocabulary
//! and one end-of-sequence id.

use std::sync::Arc;

use candle_core::{D, Tensor};

use super::{Generated, Prepared, StagePolicy};
use crate::config::TokenSequence;
use crate::model::collaborators::AudioCodec;
use crate::{Error, Result};

/// Input of the fine stage.
#[derive(Debug, Clone)]
pub struct FineInput {
    /// Coarse ids `[B, frames, Q_coarse]`.
    pub coarse_ids: Tensor,
    pub reconstruct_wave: bool,
    /// Overwrite fine ids of frames whose coarse ids are all end-of-sequence.
    pub mask_out_generated_fine_tokens: bool,
}

#[derive(Debug)]
pub struct FineCarry {
    coarse_ids: Tensor,
    reconstruct_wave: bool,
    mask_out_generated_fine_tokens: bool,
}

/// Decodes one fine frame per coarse frame. Never emits end-of-sequence.
pub struct FinePolicy {
    codec: Arc<dyn AudioCodec>,
}

impl FinePolicy {
    pub fn new(codec: Arc<dyn AudioCodec>) -> Self {
        Self { codec }
    }
}

/// Set `fine` to `eos` on every frame where all coarse channels are `eos`.
fn mask_out_fine(coarse: &Tensor, fine: &Tensor, eos: u32) -> Result<Tensor> {
    let finished = coarse.eq(eos)?.min_keepdim(D::Minus1)?;
    let finished = finished.broadcast_as(fine.shape())?;
    let eos = Tensor::full(eos, fine.shape(), fine.device())?;
    Ok(finished.where_cond(&eos, fine)?)
}

impl StagePolicy for FinePolicy {
    type Input = FineInput;
    type Output = Generated;
    type Carry = FineCarry;
    const NAME: &'static str = "fine";
    const NUM_SEQUENCES: usize = 2;

    fn prepare(&self, input: FineInput, target: &TokenSequence) -> Result<(Prepared, FineCarry)> {
        let (batch_size, frames, _) = input.coarse_ids.dims3()?;
        if frames == 0 {
            return Err(Error::precondition("fine stage needs at least one coarse frame"));
        }

        // [B, T, Q] → [B, Q, T] so the channel count is checked against the
        // coarse sequence on the way in
        let context = input.coarse_ids.transpose(1, 2)?.contiguous()?;

        let prepared = Prepared {
            batch_size,
            context: vec![context],
            prime: None,
            target_len: frames * target.tokens_per_step,
        };
        let carry = FineCarry {
            coarse_ids: input.coarse_ids,
            reconstruct_wave: input.reconstruct_wave,
            mask_out_generated_fine_tokens: input.mask_out_generated_fine_tokens,
        };
        Ok((prepared, carry))
    }

    fn eos_allowed(&self, _position: usize, _target: &TokenSequence) -> bool {
        false
    }

    fn finish(
        &self,
        generated: Tensor,
        carry: FineCarry,
        target: &TokenSequence,
    ) -> Result<Generated> {
        let (b, n) = generated.dims2()?;
        let q = target.tokens_per_step;
        let eos = target.eos_id();

        let mut fine = generated.reshape((b, n / q, q))?;
        let coarse = carry.coarse_ids.to_device(fine.device())?;
        if carry.mask_out_generated_fine_tokens {
            fine = mask_out_fine(&coarse, &fine, eos)?;
        }

        let codes = Tensor::cat(&[&coarse, &fine], D::Minus1)?;
        if !carry.reconstruct_wave {
            return Ok(Generated::Tokens(codes));
        }
        let wave = super::decode_codes(self.codec.as_ref(), &codes, eos)?;
        Ok(Generated::Wave(wave))
    }
}
