//! Error types for the storage migrator.
//!
//! Every Kubernetes API failure is classified into an [`ApiError`] so the
//! control loops can decide between retrying, resuming with a fresh continue
//! token, treating the failure as success (`NotFound` during migration), or
//! failing the migration. The crate-level [`Error`] wraps everything else.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Main error type for storage migrator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes client error that was not classified at an API seam
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Classified API error
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Discovery of served resources failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Fatal error while seeding the cluster
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create an initialization error with the given message
    pub fn initialization(msg: impl Into<String>) -> Self {
        Self::Initialization(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Classified outcome of a single Kubernetes API call.
///
/// The display form is the server's message verbatim, so condition messages
/// and logs read the same as the API server reported them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// The object does not exist
    #[error("{0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict on a write
    #[error("{0}")]
    Conflict(String),

    /// The continue token expired; the server may attach a fresh token that
    /// resumes the list on a shifted snapshot
    #[error("{message}")]
    Expired {
        /// Server message
        message: String,
        /// Fresh "inconsistent continue" token, when the server provided one
        continue_token: Option<String>,
    },

    /// Client is being throttled
    #[error("{message}")]
    TooManyRequests {
        /// Server message
        message: String,
        /// Server-suggested delay before retrying
        retry_after: Option<Duration>,
    },

    /// The request timed out server-side
    #[error("{message}")]
    Timeout {
        /// Server message
        message: String,
        /// Server-suggested delay before retrying
        retry_after: Option<Duration>,
    },

    /// Internal server error
    #[error("{0}")]
    Internal(String),

    /// The server is temporarily unable to serve the request
    #[error("{message}")]
    ServiceUnavailable {
        /// Server message
        message: String,
        /// Server-suggested delay before retrying
        retry_after: Option<Duration>,
    },

    /// The verb is not supported for this resource
    #[error("{0}")]
    MethodNotAllowed(String),

    /// The request body failed server-side validation
    #[error("{0}")]
    Invalid(String),

    /// Transport-level failure (connection reset, broken stream, ...)
    #[error("{0}")]
    Transport(String),

    /// Anything else; treated as fatal
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Whether a blind retry of the same call can succeed.
    ///
    /// Conflicts are included: the caller is expected to refresh the object
    /// before the next attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_)
                | Self::TooManyRequests { .. }
                | Self::Timeout { .. }
                | Self::Internal(_)
                | Self::ServiceUnavailable { .. }
                | Self::Transport(_)
        )
    }

    /// Server-suggested delay before the next attempt, if any
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::TooManyRequests { retry_after, .. }
            | Self::Timeout { retry_after, .. }
            | Self::ServiceUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this is a NotFound error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this is a write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Classify a raw `Status` body, capturing the inconsistent-continue
    /// token and any `retryAfterSeconds` hint.
    pub fn from_status(status: &StatusBody) -> Self {
        let reason = status.reason.as_deref().unwrap_or("");
        let code = status.code.unwrap_or(0) as u16;
        let message = status
            .message
            .clone()
            .unwrap_or_else(|| format!("request failed with status code {code}"));
        let retry_after = status
            .details
            .as_ref()
            .and_then(|d| d.retry_after_seconds)
            .map(|s| Duration::from_secs(s.max(0) as u64));
        let continue_token = status
            .metadata
            .as_ref()
            .and_then(|m| m.continue_.clone())
            .filter(|t| !t.is_empty());
        Self::classify(reason, code, message, retry_after, continue_token)
    }

    fn classify(
        reason: &str,
        code: u16,
        message: String,
        retry_after: Option<Duration>,
        continue_token: Option<String>,
    ) -> Self {
        match (reason, code) {
            ("NotFound", _) | (_, 404) => Self::NotFound(message),
            ("Conflict", _) | (_, 409) => Self::Conflict(message),
            ("Expired", _) | ("Gone", _) | (_, 410) => Self::Expired {
                message,
                continue_token,
            },
            ("TooManyRequests", _) | (_, 429) => Self::TooManyRequests {
                message,
                retry_after,
            },
            ("Timeout", _) | ("ServerTimeout", _) | (_, 504) => Self::Timeout {
                message,
                retry_after,
            },
            ("InternalError", _) | (_, 500) => Self::Internal(message),
            ("ServiceUnavailable", _) | (_, 503) => Self::ServiceUnavailable {
                message,
                retry_after,
            },
            ("MethodNotAllowed", _) | (_, 405) => Self::MethodNotAllowed(message),
            ("Invalid", _) | ("BadRequest", _) | (_, 422) => Self::Invalid(message),
            _ => Self::Other(message),
        }
    }
}

/// The parts of a Kubernetes `Status` failure body the taxonomy reads.
///
/// Parsed from the raw response on the dynamic list path, where the typed
/// client would drop the list metadata (and with it the fresh continue
/// token of a 410).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    /// HTTP status code
    #[serde(default)]
    pub code: Option<i32>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
    /// Extended failure details
    #[serde(default)]
    pub details: Option<StatusBodyDetails>,
    /// List metadata; carries the fresh continue token on a 410
    #[serde(default)]
    pub metadata: Option<StatusBodyMeta>,
}

/// Details attached to a `Status` failure
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBodyDetails {
    /// Seconds the client should wait before retrying
    #[serde(default)]
    pub retry_after_seconds: Option<i32>,
}

/// List metadata attached to a `Status` failure
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatusBodyMeta {
    /// Continue token to resume an expired list on a shifted snapshot
    #[serde(rename = "continue", default)]
    pub continue_: Option<String>,
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(er) => Self::classify(&er.reason, er.code, er.message, None, None),
            kube::Error::HyperError(e) => Self::Transport(e.to_string()),
            kube::Error::Service(e) => Self::Transport(e.to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// Errors collected from a page of concurrent item migrations.
///
/// A lone error displays as itself so terminal condition messages stay
/// readable; multiple errors are bracketed and comma-joined.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateError(Vec<ApiError>);

impl std::error::Error for AggregateError {}

impl AggregateError {
    /// Wrap the collected errors; `errors` must be non-empty
    pub fn new(errors: Vec<ApiError>) -> Self {
        debug_assert!(!errors.is_empty());
        Self(errors)
    }

    /// The individual errors
    pub fn errors(&self) -> &[ApiError] {
        &self.0
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            many => {
                write!(f, "[")?;
                for (i, e) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, "]")
            }
        }
    }
}
