//! Error types for the embedding client

/// Result type for embedding operations.
///
/// Convenience alias using [`EmbedError`] as the error type, used throughout
/// the crate for operations that can fail.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Covers configuration problems, transport-level failures and responses
/// the service returned but that cannot be matched back to the request.
/// Integrates with [`thiserror`] for automatic [`std::error::Error`]
/// implementation and error chaining.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// The provider configuration is unusable
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Transport-level failure talking to the embedding service
    #[error("Embedding request failed: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status
    #[error("Embedding service returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// The response cannot be aligned with the request batch
    #[error("Embedding response mismatch: expected {expected} embeddings, got {got}")]
    ResponseMismatch { expected: usize, got: usize },

    /// An embedding came back with an unexpected dimension
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
