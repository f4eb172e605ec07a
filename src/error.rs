//! Error types for the inference client and the conversation orchestrator.
//!
//! Storage keeps returning `anyhow::Error`; these enums only exist where callers
//! need to tell failures apart.

use thiserror::Error;
use uuid::Uuid;

/// Failure of a single inference request.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// No provider selected, or the provider needs a key that isn't there.
    /// Raised before any network traffic.
    #[error("credential missing: {0}")]
    CredentialMissing(String),
    /// Network failure or a non-success HTTP status.
    #[error("transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },
    /// Success status, but the body didn't have the expected shape.
    #[error("unexpected response structure: {0}")]
    Structural(String),
    /// The consumer stopped reading the stream.
    #[error("stream abandoned")]
    Cancelled,
}

impl InferenceError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_credential_missing(&self) -> bool {
        matches!(self, Self::CredentialMissing(_))
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Errors surfaced by the orchestrator. The precondition variants are returned
/// before anything is written.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("no inference provider configured; choose one in settings")]
    NoProviderConfigured,
    #[error("a response is already being generated for conversation {0}")]
    GenerationInFlight(Uuid),
    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),
    #[error("nothing to regenerate in conversation {0}")]
    NothingToRegenerate(Uuid),
    #[error("message is empty")]
    EmptyInput,
    #[error("generation for conversation {0} was abandoned")]
    Cancelled(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
