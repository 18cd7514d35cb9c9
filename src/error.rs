//! Error types for musiclm-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Nothing here is retryable: every variant is either a broken tensor
/// operation, a misconfigured model, or a caller passing inputs that violate
/// a documented precondition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, detected at construction time.
    #[error("config: {0}")]
    Config(String),

    /// Call-time precondition violation (missing text, wrong sequence count, ...).
    #[error("precondition: {0}")]
    Precondition(String),

    /// Failure reported by an injected collaborator (codec, extractor, text encoder).
    #[error("collaborator: {0}")]
    Collaborator(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }
}
