//! Configuration for the token-conditioned transformers and the MusicLM pipeline.
//!
//! Every struct deserializes from JSON with per-field defaults, so a config
//! file only needs to spell out what differs from the small default model.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Descriptor of one discrete token stream handled by a
/// [`TokenConditionedTransformer`](crate::model::token_conditioned::TokenConditionedTransformer).
///
/// e.g. semantic tokens (`tokens_per_step = 1`), coarse acoustic tokens
/// (`tokens_per_step = Q_coarse`), fine acoustic tokens (`Q_fine`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSequence {
    /// Optional label used in logs and error messages.
    #[serde(default)]
    pub name: Option<String>,

    /// Codebook size, excluding the reserved end-of-sequence id.
    pub vocab_size: usize,

    /// Parallel residual channels emitted per time step.
    #[serde(default = "default_tokens_per_step")]
    pub tokens_per_step: usize,

    /// Expected maximum flattened length (time steps × tokens_per_step).
    pub sequence_length: usize,
}

impl TokenSequence {
    pub fn new(
        name: impl Into<String>,
        vocab_size: usize,
        tokens_per_step: usize,
        sequence_length: usize,
    ) -> Self {
        Self {
            name: Some(name.into()),
            vocab_size,
            tokens_per_step,
            sequence_length,
        }
    }

    /// The reserved end-of-sequence id (one past the natural vocabulary).
    pub fn eos_id(&self) -> u32 {
        self.vocab_size as u32
    }

    /// Vocabulary size including the end-of-sequence id.
    pub fn vocab_size_with_eos(&self) -> usize {
        self.vocab_size + 1
    }

    /// Number of whole time steps covered by `sequence_length`.
    pub fn time_steps(&self) -> usize {
        self.sequence_length / self.tokens_per_step.max(1)
    }

    /// Label for logs and errors.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::config(format!(
                "token sequence '{}' has vocab_size 0",
                self.label()
            )));
        }
        if self.tokens_per_step == 0 {
            return Err(Error::config(format!(
                "token sequence '{}' has tokens_per_step 0",
                self.label()
            )));
        }
        Ok(())
    }
}

/// Configuration of one
/// [`TokenConditionedTransformer`](crate::model::token_conditioned::TokenConditionedTransformer).
///
/// The attention stack itself is injected; this only covers the parameters
/// the core owns (embeddings, start tokens, logit projections, null condition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConditionedConfig {
    /// Token streams in the order they are concatenated.
    pub token_sequences: Vec<TokenSequence>,

    /// Model dimension shared by every embedding and the attention stack.
    #[serde(default = "default_dim")]
    pub dim: usize,

    /// Whether the model consumes a condition signal (text embedding).
    #[serde(default)]
    pub has_condition: bool,

    /// Width of the incoming condition embedding. `None` means `dim`.
    #[serde(default)]
    pub condition_dim: Option<usize>,

    /// Probability of replacing a batch row's condition with the null
    /// condition when the caller does not override it.
    #[serde(default = "default_cond_drop_prob")]
    pub cond_drop_prob: f64,

    /// Build a causal self-attention mask when the caller passes none.
    #[serde(default = "default_causal")]
    pub causal: bool,
}

impl TokenConditionedConfig {
    pub fn new(token_sequences: Vec<TokenSequence>, dim: usize) -> Self {
        Self {
            token_sequences,
            dim,
            has_condition: false,
            condition_dim: None,
            cond_drop_prob: default_cond_drop_prob(),
            causal: default_causal(),
        }
    }

    /// Enable conditioning with a condition embedding of width `condition_dim`.
    pub fn with_condition(mut self, condition_dim: usize) -> Self {
        self.has_condition = true;
        self.condition_dim = Some(condition_dim);
        self
    }

    /// Effective condition width.
    pub fn condition_dim(&self) -> usize {
        self.condition_dim.unwrap_or(self.dim)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_sequences.is_empty() {
            return Err(Error::config("at least one token sequence is required"));
        }
        for sequence in &self.token_sequences {
            sequence.validate()?;
        }
        if self.dim == 0 {
            return Err(Error::config("model dim must be positive"));
        }
        if self.condition_dim == Some(0) {
            return Err(Error::config("condition_dim must be positive"));
        }
        if !(0.0..=1.0).contains(&self.cond_drop_prob) {
            return Err(Error::config(format!(
                "cond_drop_prob must be in [0, 1], got {}",
                self.cond_drop_prob
            )));
        }
        Ok(())
    }
}

/// Per-stage sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Gumbel sampling temperature. `<= 0` means greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Top-k threshold: keep the top `ceil((1 - filter_thres) * vocab)` logits.
    #[serde(default = "default_filter_thres")]
    pub filter_thres: f64,

    /// Classifier-free guidance scale.
    #[serde(default = "default_cond_scale")]
    pub cond_scale: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            filter_thres: default_filter_thres(),
            cond_scale: default_cond_scale(),
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.filter_thres) {
            return Err(Error::config(format!(
                "filter_thres must be in [0, 1), got {}",
                self.filter_thres
            )));
        }
        Ok(())
    }
}

/// Full three-stage pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicLmConfig {
    /// Semantic stage: `[semantic]`.
    pub semantic: TokenConditionedConfig,
    /// Coarse stage: `[semantic, coarse]`.
    pub coarse: TokenConditionedConfig,
    /// Fine stage: `[coarse, fine]`.
    pub fine: TokenConditionedConfig,

    #[serde(default)]
    pub semantic_sampling: SamplingConfig,
    #[serde(default)]
    pub coarse_sampling: SamplingConfig,
    #[serde(default)]
    pub fine_sampling: SamplingConfig,

    /// Collapse repeated semantic ids of a primed prompt.
    #[serde(default = "default_unique_consecutive")]
    pub unique_consecutive: bool,
}

impl MusicLmConfig {
    /// Build the standard stage layout from the three token streams.
    ///
    /// When `condition_dim` is given, every stage is text-conditioned.
    pub fn from_token_sequences(
        semantic: TokenSequence,
        coarse: TokenSequence,
        fine: TokenSequence,
        dim: usize,
        condition_dim: Option<usize>,
    ) -> Self {
        let stage = |sequences: Vec<TokenSequence>| {
            let cfg = TokenConditionedConfig::new(sequences, dim);
            match condition_dim {
                Some(d) => cfg.with_condition(d),
                None => cfg,
            }
        };
        Self {
            semantic: stage(vec![semantic.clone()]),
            coarse: stage(vec![semantic, coarse.clone()]),
            fine: stage(vec![coarse, fine]),
            semantic_sampling: SamplingConfig::default(),
            coarse_sampling: SamplingConfig::default(),
            fine_sampling: SamplingConfig::default(),
            unique_consecutive: default_unique_consecutive(),
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.semantic.validate()?;
        self.coarse.validate()?;
        self.fine.validate()?;
        self.semantic_sampling.validate()?;
        self.coarse_sampling.validate()?;
        self.fine_sampling.validate()
    }
}

fn default_tokens_per_step() -> usize {
    1
}
fn default_dim() -> usize {
    1024
}
fn default_cond_drop_prob() -> f64 {
    0.5
}
fn default_causal() -> bool {
    true
}
fn default_temperature() -> f64 {
    1.0
}
fn default_filter_thres() -> f64 {
    0.9
}
fn default_cond_scale() -> f64 {
    3.0
}
fn default_unique_consecutive() -> bool {
    true
}
