//! MusicLM-style hierarchical music generation in pure Rust.
//!
//! A candle-based implementation of the token-conditioned transformer that
//! drives the three MusicLM stages. The attention stack, text encoder,
//! semantic tokenizer and audio codec are injected through traits in
//! [`model::collaborators`].
//!
//! ## Architecture
//!
//! The pipeline turns text (and optionally a prime wave) into audio:
//!
//! ```text
//! text → TextConditioner ──────────────┐ (condition for every stage)
//!                                      ↓
//!        semantic stage   [semantic]            → semantic ids
//!                                      ↓
//!        coarse stage     [semantic, coarse]    → coarse codec ids
//!                                      ↓
//!        fine stage       [coarse, fine]        → fine codec ids
//!                                      ↓
//!                  AudioCodec::decode(coarse ‖ fine) → wave
//! ```
//!
//! Each stage wraps one [`TokenConditionedTransformer`], which interleaves
//! any number of heterogeneous token streams into a single attention input
//! and projects the result back to per-stream logits.
//!
//! ## Modules
//!
//! - [`config`] — token-sequence descriptors, model and sampling configuration
//! - [`model`] — transformer core, classifier-free guidance, collaborator traits
//! - [`sampling`] — top-k, gumbel sampling, end-of-sequence helpers
//! - [`stage`] — the shared autoregressive loop and the three stage policies
//! - [`pipeline`] — end-to-end generation
//!
//! [`TokenConditionedTransformer`]: model::token_conditioned::TokenConditionedTransformer

pub mod config;
pub mod model;
pub mod pipeline;
pub mod sampling;
pub mod stage;

mod error;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use error::{Error, Result};
