//! Error types for nzb-triage
//!
//! Every failure inside a single candidate's evaluation is captured into that
//! candidate's decision; these errors only travel between the internal layers
//! (parser, session, pool, fetcher) and the code that classifies them.

use thiserror::Error;

/// Result type alias for nzb-triage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-triage
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "NZB_TRIAGE_MAX_CONNECTIONS")
        key: Option<String>,
    },

    /// Malformed manifest (unparsable markup, missing message ids, no files)
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// NNTP protocol or transport failure on a session
    #[error("NNTP error: {0}")]
    Nntp(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Candidate manifest could not be downloaded
    #[error("fetch error: {0}")]
    Fetch(String),

    /// An operation ran past its deadline
    #[error("operation timed out")]
    Timeout,

    /// No pooled connection became available before the caller's deadline
    #[error("connection pool exhausted: no connection available before deadline")]
    PoolExhausted,

    /// The pool was closed while the caller was waiting or before it asked
    #[error("connection pool is closed")]
    PoolClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Machine-readable error code, stable across releases
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidNzb(_) => "invalid_nzb",
            Error::Nntp(_) => "nntp_error",
            Error::Tls(_) => "tls_error",
            Error::Fetch(_) => "fetch_error",
            Error::Timeout => "timeout",
            Error::PoolExhausted => "pool_exhausted",
            Error::PoolClosed => "pool_closed",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the session that produced this error can no longer be trusted.
    ///
    /// Connection failures lead to the connection being discarded and the command
    /// retried on a fresh one; they are never a statement about the content.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::Nntp(_) | Error::Tls(_) | Error::Io(_) | Error::Timeout
        )
    }

    /// Shorthand for a configuration error tied to a key
    pub(crate) fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
