//! Model components for MusicLM.
//!
//! ## Components
//!
//! - [`token_conditioned`] — multi-sequence transformer core shared by all three stages
//! - [`guidance`] — classifier-free guidance on top of the core
//! - [`embedding`] — per-sequence embeddings, start tokens and logit heads
//! - [`mask`] — additive self-attention masks
//! - [`collaborators`] — traits for the injected attention stack, text
//!   conditioner, semantic tokenizer and audio codec

pub mod collaborators;
pub mod embedding;
pub mod guidance;
pub mod mask;
pub mod token_conditioned;
