//! Error types shared across the crate.
//!
//! Configuration problems ([`ConfigError`], [`DurationError`]) surface
//! synchronously while the writer is being set up and are fatal to startup.
//! Shipping problems ([`PushError`]) never reach the producer; the shipper
//! retries, drops and logs them.

use reqwest::StatusCode;
use thiserror::Error;

/// Failure to parse a duration shorthand such as `"2h30m"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    /// No `<integer><unit>` token was found in the input. Units outside
    /// ms, s, m, h, d, w never form a token, so `"5y"` lands here too.
    #[error("invalid time duration format: {0:?}")]
    NoMatch(String),

    /// The numeric component of a token could not be represented.
    #[error("invalid time duration format, unable to parse time value, get: {0}")]
    InvalidValue(String),
}

/// Invalid or missing configuration.
///
/// The display form always starts with the offending field so that a user
/// can find it in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} {message}")]
pub struct ConfigError {
    /// Configuration key that failed validation
    pub field: String,

    /// Human readable reason
    pub message: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// A directive that expected an argument but found none.
    pub fn missing_argument(field: &str, line: usize) -> Self {
        Self::new(field, format!("requires an argument (line {line})"))
    }

    pub(crate) fn invalid_duration(field: &str, err: DurationError) -> Self {
        Self::new(field, format!("parameter failed to parse, invalid duration: {err}"))
    }

    pub(crate) fn invalid_int(field: &str, value: &str) -> Self {
        Self::new(field, format!("parameter failed to parse, invalid int: {value:?}"))
    }
}

/// Errors that can occur while pushing one batch to the ingestion endpoint.
#[derive(Debug, Error)]
pub enum PushError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The request did not complete within the configured timeout
    #[error("request timed out")]
    Timeout,

    /// Server answered with a non-success status
    #[error("server returned {code}: {body}")]
    Status { code: StatusCode, body: String },

    /// Credentials could not be loaded or exchanged
    #[error("authorization failed: {0}")]
    Auth(String),

    /// The batch could not be encoded
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for PushError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PushError::Timeout
        } else {
            PushError::Request(err)
        }
    }
}

impl PushError {
    /// Whether the push may succeed if attempted again.
    ///
    /// Network errors, timeouts, 5xx and 429 are retryable; any other
    /// status, credential or encoding failure is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PushError::Request(_) | PushError::Timeout => true,
            PushError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            PushError::Auth(_) | PushError::Encode(_) => false,
        }
    }

    /// Whether the server rejected the push for exceeding a rate limit.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PushError::Status { code, .. } if *code == StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Failure to open a writer from a validated configuration.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The module was opened before a successful `validate`
    #[error("writer opened before configuration was validated")]
    NotValidated,

    /// The HTTP client could not be built (bad certificate, proxy, ...)
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// The background shipping worker could not be started
    #[error("failed to start shipper: {0}")]
    Spawn(#[from] std::io::Error),
}
