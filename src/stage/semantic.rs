//! Semantic stage: text and an optional prime wave → semantic ids.

use std::sync::Arc;

use candle_core::Tensor;

use super::{Prepared, StagePolicy};
use crate::config::TokenSequence;
use crate::model::collaborators::SemanticTokenizer;
use crate::sampling;
use crate::{Error, Result};

/// Input of the semantic stage.
#[derive(Debug, Clone)]
pub struct SemanticInput {
    pub batch_size: usize,
    /// Optional raw audio `[B, samples]` whose semantic ids seed generation.
    pub prime_wave: Option<Tensor>,
    /// Number of semantic ids to produce per row.
    pub max_length: usize,
}

/// Decodes semantic ids, stopping once every row has emitted end-of-sequence.
///
/// Output is always `[B, max_length]`; rows that stopped early are padded with
/// end-of-sequence ids.
pub struct SemanticPolicy {
    tokenizer: Arc<dyn SemanticTokenizer>,
    unique_consecutive: bool,
}

impl SemanticPolicy {
    pub fn new(tokenizer: Arc<dyn SemanticTokenizer>, unique_consecutive: bool) -> Self {
        Self {
            tokenizer,
            unique_consecutive,
        }
    }

    fn prime_ids(&self, wave: &Tensor, batch_size: usize) -> Result<Tensor> {
        let wave_batch = wave.dim(0)?;
        if wave_batch != batch_size {
            return Err(Error::precondition(format!(
                "prime wave has batch {wave_batch}, expected {batch_size}"
            )));
        }
        let ids = self.tokenizer.tokenize(wave)?;
        if self.unique_consecutive {
            sampling::unique_consecutive(&ids)
        } else {
            Ok(ids)
        }
    }
}

impl StagePolicy for SemanticPolicy {
    type Input = SemanticInput;
    type Output = Tensor;
    type Carry = ();
    const NAME: &'static str = "semantic";
    const NUM_SEQUENCES: usize = 1;

    fn prepare(&self, input: SemanticInput, _target: &TokenSequence) -> Result<(Prepared, ())> {
        if input.max_length == 0 {
            return Err(Error::precondition("max_length must be positive"));
        }
        let prime = input
            .prime_wave
            .as_ref()
            .map(|wave| self.prime_ids(wave, input.batch_size))
            .transpose()?;
        let prepared = Prepared {
            batch_size: input.batch_size,
            context: Vec::new(),
            prime,
            target_len: input.max_length,
        };
        Ok((prepared, ()))
    }

    fn stop_on_eos(&self) -> bool {
        true
    }

    fn finish(&self, generated: Tensor, _carry: (), _target: &TokenSequence) -> Result<Tensor> {
        Ok(generated)
    }
}
