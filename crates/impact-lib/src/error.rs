//! Error taxonomy for the impact engine
//!
//! Failures are resource-scoped: a fetch that keeps failing surfaces as a
//! typed error for that resource only, never as a panic or a silent zero.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, ImpactError>;

/// Errors raised while fetching inputs or computing impact metrics
#[derive(Debug, Clone, Error)]
pub enum ImpactError {
    /// Upstream was rate-limited or momentarily unavailable
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// Bad selector, missing credentials or unset inputs; never retried
    #[error("configuration error: {0}")]
    PermanentConfig(String),

    /// No static-parameter entry matched the SKU
    #[error("no static parameters for '{0}'")]
    MissingStaticParam(String),

    /// A single attempt exceeded its deadline
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Every retry failed; carries the last underlying error
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ImpactError>,
    },

    /// Malformed ISO-8601 duration
    #[error("invalid ISO-8601 duration '{0}'")]
    InvalidDuration(String),

    /// Collaborator returned a payload that could not be decoded
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },
}

impl ImpactError {
    /// Whether the controller should retry the failed attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ImpactError::TransientFetch(_) | ImpactError::Timeout(_))
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ImpactError::TransientFetch(_) => "transient",
            ImpactError::PermanentConfig(_) => "config",
            ImpactError::MissingStaticParam(_) => "missing_static_param",
            ImpactError::Timeout(_) => "timeout",
            ImpactError::RetriesExhausted { .. } => "retries_exhausted",
            ImpactError::InvalidDuration(_) => "invalid_duration",
            ImpactError::Parse { .. } => "parse",
        }
    }

    pub(crate) fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        ImpactError::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for ImpactError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ImpactError::parse("response body", err);
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                ImpactError::TransientFetch(err.to_string())
            }
            Some(_) => ImpactError::PermanentConfig(err.to_string()),
            // Connection refused, reset, DNS hiccups
            None => ImpactError::TransientFetch(err.to_string()),
        }
    }
}
