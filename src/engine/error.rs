//! Error types for GG-SESSION.
//!
//! All errors are fail-closed: a failed request is reported, never hidden.
//! Output already streamed before a failure is not retracted.

use thiserror::Error;

/// Errors surfaced by an [`InferenceBackend`](super::InferenceBackend).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Evaluation failed at position {n_past}: {reason}")]
    Evaluation { n_past: usize, reason: String },

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Embeddings unsupported: {0}")]
    EmbeddingUnsupported(String),
}

/// Errors that can occur while driving a generation session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Context overflow: {len} tokens exceed context window of {max}")]
    ContextOverflow { len: usize, max: usize },

    #[error("Evaluation failure: {0}")]
    EvaluationFailure(String),

    #[error("You need to pass the prompt")]
    InvalidPromptEmpty,

    #[error("Invalid generation policy: {0}")]
    InvalidPolicy(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("No active request: call begin() before step()")]
    NoActiveRequest,

    #[error("To use completion function, disable embedding mode")]
    EmbeddingModeEnabled,

    #[error("Embeddings unavailable: {0}")]
    EmbeddingUnavailable(String),
}

impl SessionError {
    /// Returns true if the request cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EvaluationFailure(_) | Self::ContextOverflow { .. })
    }

    /// Returns true if the caller supplied a bad request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPromptEmpty
                | Self::InvalidPolicy(_)
                | Self::ContextOverflow { .. }
                | Self::EmbeddingModeEnabled
                | Self::EmbeddingUnavailable(_)
        )
    }
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Evaluation { .. } => Self::EvaluationFailure(err.to_string()),
            BackendError::Tokenize(reason) => Self::Tokenization(reason),
            BackendError::EmbeddingUnsupported(reason) => Self::EmbeddingUnavailable(reason),
        }
    }
}
