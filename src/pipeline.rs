//! End-to-end text-to-music generation.
//!
//! Chains the three stages:
//! 1. Semantic — text (+ optional prime wave) → semantic ids
//! 2. Coarse — semantic ids → coarse codec ids (or a coarse-only wave)
//! 3. Fine — coarse ids → fine codec ids, decoded to the final wave

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::MusicLmConfig;
use crate::model::collaborators::{
    AttentionTransformer, AudioCodec, SemanticTokenizer, TextConditioner,
};
use crate::model::token_conditioned::TokenConditionedTransformer;
use crate::stage::coarse::{CoarseInput, CoarsePolicy};
use crate::stage::fine::{FineInput, FinePolicy};
use crate::stage::semantic::{SemanticInput, SemanticPolicy};
use crate::stage::{Stage, decode_codes};
use crate::{Error, Result};

/// Parameters for a single generation call.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub batch_size: usize,
    /// One prompt per batch row. Required when any stage is conditioned.
    pub text: Option<Vec<String>>,
    /// Audio `[B, samples]` to continue from.
    pub prime_wave: Option<Tensor>,
    /// Number of semantic ids to generate.
    pub max_length: usize,
    /// Stop after the coarse stage and return its decoded wave.
    pub return_coarse_generated_wave: bool,
    pub mask_out_generated_fine_tokens: bool,
    /// Random seed (`None` = random).
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            batch_size: 1,
            text: None,
            prime_wave: None,
            max_length: 2048,
            return_coarse_generated_wave: false,
            mask_out_generated_fine_tokens: false,
            seed: None,
        }
    }
}

/// Everything produced by one generation call.
#[derive(Debug, Clone)]
pub struct GeneratedMusic {
    /// `[B, max_length]`
    pub semantic_ids: Tensor,
    /// `[B, frames, Q_coarse + Q_fine]`, absent when the coarse wave was returned.
    pub acoustic_ids: Option<Tensor>,
    /// `[B, samples]`
    pub wave: Tensor,
}

/// Collaborators the pipeline is built around.
pub struct MusicLmComponents {
    pub semantic_transformer: Box<dyn AttentionTransformer>,
    pub coarse_transformer: Box<dyn AttentionTransformer>,
    pub fine_transformer: Box<dyn AttentionTransformer>,
    /// Required when any stage is conditioned.
    pub text_conditioner: Option<Arc<dyn TextConditioner>>,
    pub semantic_tokenizer: Arc<dyn SemanticTokenizer>,
    pub codec: Arc<dyn AudioCodec>,
}

/// The three-stage MusicLM generator.
pub struct MusicLm {
    semantic: Stage<SemanticPolicy>,
    coarse: Stage<CoarsePolicy>,
    fine: Stage<FinePolicy>,
    codec: Arc<dyn AudioCodec>,
}

/// Check that the three stage layouts agree with each other.
fn check_stage_layout(config: &MusicLmConfig) -> Result<()> {
    let semantic = &config.semantic.token_sequences;
    let coarse = &config.coarse.token_sequences;
    let fine = &config.fine.token_sequences;
    if semantic.len() != 1 || coarse.len() != 2 || fine.len() != 2 {
        return Err(Error::config(format!(
            "expected [semantic], [semantic, coarse], [coarse, fine] stage layouts, \
             got {}, {}, {} sequences",
            semantic.len(),
            coarse.len(),
            fine.len()
        )));
    }

    if semantic[0].vocab_size != coarse[0].vocab_size {
        return Err(Error::config(format!(
            "semantic vocab {} does not match the coarse stage's semantic vocab {}",
            semantic[0].vocab_size, coarse[0].vocab_size
        )));
    }

    let acoustic = coarse[1].vocab_size;
    if fine[0].vocab_size != acoustic || fine[1].vocab_size != acoustic {
        return Err(Error::config(format!(
            "coarse acoustic vocab {acoustic} does not match fine stage vocabs {} / {}",
            fine[0].vocab_size, fine[1].vocab_size
        )));
    }

    if coarse[1].tokens_per_step != fine[0].tokens_per_step {
        return Err(Error::config(format!(
            "coarse stage emits {} channels per step, fine stage expects {}",
            coarse[1].tokens_per_step, fine[0].tokens_per_step
        )));
    }
    Ok(())
}

impl MusicLm {
    /// Build the pipeline.
    ///
    /// Stage weights live under `semantic.*`, `coarse.*` and `fine.*` in `vb`.
    pub fn new(
        config: &MusicLmConfig,
        components: MusicLmComponents,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        check_stage_layout(config)?;

        let MusicLmComponents {
            semantic_transformer,
            coarse_transformer,
            fine_transformer,
            text_conditioner,
            semantic_tokenizer,
            codec,
        } = components;

        let semantic = Stage::new(
            TokenConditionedTransformer::new(
                &config.semantic,
                semantic_transformer,
                vb.pp("semantic"),
            )?,
            SemanticPolicy::new(semantic_tokenizer, config.unique_consecutive),
            config.semantic_sampling,
            text_conditioner.clone(),
        )?;
        let coarse = Stage::new(
            TokenConditionedTransformer::new(&config.coarse, coarse_transformer, vb.pp("coarse"))?,
            CoarsePolicy::new(codec.clone()),
            config.coarse_sampling,
            text_conditioner.clone(),
        )?;
        let fine = Stage::new(
            TokenConditionedTransformer::new(&config.fine, fine_transformer, vb.pp("fine"))?,
            FinePolicy::new(codec.clone()),
            config.fine_sampling,
            text_conditioner,
        )?;

        tracing::info!(
            semantic_vocab = config.semantic.token_sequences[0].vocab_size,
            acoustic_vocab = config.coarse.token_sequences[1].vocab_size,
            coarse_channels = config.coarse.token_sequences[1].tokens_per_step,
            fine_channels = config.fine.token_sequences[1].tokens_per_step,
            "MusicLM pipeline ready"
        );

        Ok(Self {
            semantic,
            coarse,
            fine,
            codec,
        })
    }

    /// Whether any stage needs a text prompt.
    pub fn requires_text(&self) -> bool {
        self.semantic.has_condition() || self.coarse.has_condition() || self.fine.has_condition()
    }

    /// Generate a waveform `[B, samples]`.
    pub fn generate(&self, params: &GenerationParams) -> Result<Tensor> {
        Ok(self.generate_music(params)?.wave)
    }

    /// Generate a waveform and keep the intermediate token ids.
    pub fn generate_music(&self, params: &GenerationParams) -> Result<GeneratedMusic> {
        let text = params.text.as_deref();
        if self.requires_text() && text.is_none() {
            return Err(Error::precondition(
                "text needs to be passed in if one of the transformers requires conditioning",
            ));
        }
        if let Some(text) = text
            && text.len() != params.batch_size
        {
            return Err(Error::precondition(format!(
                "got {} prompts for batch size {}",
                text.len(),
                params.batch_size
            )));
        }

        let seed = params.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        tracing::info!(
            batch = params.batch_size,
            max_length = params.max_length,
            seed,
            primed = params.prime_wave.is_some(),
            "generating music"
        );

        let semantic_ids = self.semantic.generate(
            SemanticInput {
                batch_size: params.batch_size,
                prime_wave: params.prime_wave.clone(),
                max_length: params.max_length,
            },
            text,
            &mut rng,
        )?;

        let coarse = self.coarse.generate(
            CoarseInput {
                semantic_ids: semantic_ids.clone(),
                prime_wave: params.prime_wave.clone(),
                reconstruct_wave: params.return_coarse_generated_wave,
            },
            text,
            &mut rng,
        )?;

        if params.return_coarse_generated_wave {
            return Ok(GeneratedMusic {
                semantic_ids,
                acoustic_ids: None,
                wave: coarse.into_tensor(),
            });
        }

        let coarse_ids = coarse.into_tensor();
        let fine = self.fine.generate(
            FineInput {
                coarse_ids: coarse_ids.clone(),
                reconstruct_wave: false,
                mask_out_generated_fine_tokens: params.mask_out_generated_fine_tokens,
            },
            text,
            &mut rng,
        )?;
        let acoustic_ids = fine.into_tensor();

        let eos = self.fine.target().eos_id();
        let wave = decode_codes(self.codec.as_ref(), &acoustic_ids, eos)?;
        tracing::info!(samples = wave.dim(1)?, "generation complete");

        Ok(GeneratedMusic {
            semantic_ids,
            acoustic_ids: Some(acoustic_ids),
            wave,
        })
    }
}
