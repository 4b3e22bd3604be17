//! Error types for the evaluation harness.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Whether a backend failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Network hiccup, timeout, or rate limit. Retried with backoff.
    Transient,
    /// Auth failure or invalid request. Never retried.
    Fatal,
}

/// Errors that can occur in the harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Invalid or missing configuration. Aborts before execution.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A model or embedding backend call failed.
    #[error("Backend error ({kind:?}): {message}")]
    Backend {
        kind: BackendErrorKind,
        message: String,
    },

    /// Persistence failure. A run that cannot be durably recorded is a
    /// failed run, never a silently dropped one.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The document path does not exist.
    #[error("Document not found at '{0}'")]
    DocumentNotFound(PathBuf),

    /// No documents found in the corpus directory.
    #[error("No documents found in corpus at '{0}'")]
    EmptyCorpus(PathBuf),

    /// A run record directory does not exist.
    #[error("Run record not found at '{0}'")]
    RecordNotFound(PathBuf),
}

impl HarnessError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a transient backend error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Backend {
            kind: BackendErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Create a fatal backend error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            kind: BackendErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// Whether this error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                kind: BackendErrorKind::Transient,
                ..
            }
        )
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(err: reqwest::Error) -> Self {
        // Connection problems and timeouts are worth retrying; anything
        // structural about the request is not.
        if err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode() {
            HarnessError::transient(err.to_string())
        } else {
            HarnessError::fatal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Serialization(err.to_string())
    }
}
