//! Error types for lexcascade.

use thiserror::Error;

use crate::llm::types::Provider;

/// Result type alias using lexcascade's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a provider-call failure, used to drive failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 5xx, timeout, connection reset. Retry against another backend.
    Transient,
    /// 429 or a provider-specific quota signal.
    RateLimited,
    /// The backend answered but the payload was empty or undecodable.
    MalformedOutput,
    /// Anything else (auth failures, 4xx, missing credentials).
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::MalformedOutput => write!(f, "malformed_output"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Errors that can occur while routing analysis requests.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error. Fatal, aborts before any record is processed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A single backend call failed.
    #[error("{provider} error ({kind}): {message}")]
    Provider {
        provider: Provider,
        kind: ErrorKind,
        message: String,
    },

    /// Every configured backend failed for one record. Non-fatal to the run.
    #[error("all backends exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// A single input record could not be processed. Non-fatal to the run.
    #[error("record error: {0}")]
    Record(String),

    /// I/O error on the record streams.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a per-record error.
    pub fn record(message: impl Into<String>) -> Self {
        Self::Record(message.into())
    }

    /// Create a provider-call error.
    pub fn provider(provider: Provider, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            kind,
            message: message.into(),
        }
    }

    /// The failure classification, if this is a provider-call error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this failure counts as a quota signal.
    pub fn is_rate_limited(&self) -> bool {
        self.kind() == Some(ErrorKind::RateLimited)
    }
}
