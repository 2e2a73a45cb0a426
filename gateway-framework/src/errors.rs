//! Crate-wide error taxonomy.
//!
//! The backend client's failures fall into five kinds (`Transient`, `Timeout`,
//! `Client`, `Syntax`, `Server`); the allocation manager, client factory and
//! subgraph service each add one operational kind of their own. All of them
//! are collected here so callers one layer up (the binary, or an embedding
//! application) can match on a single `Error` rather than threading five
//! separate error types through their own call sites.

use std::time::Duration;

/// A JSON-serializable detail blob attached to an error for callers that want
/// more than the message string.
pub type ErrorDetails = serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network failure, 502/503/504, connect failure, or an open circuit
    /// breaker. Retriable.
    #[error("transient backend failure: {message}")]
    Transient {
        message: String,
        status: Option<u16>,
        details: Option<ErrorDetails>,
    },

    /// Deadline exceeded mid-call. A subtype of `Transient` in the retry
    /// policy (retriable the same way) but reported distinctly.
    #[error("backend call timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// 400/401/403/404/422 or a validation failure. Never retried.
    #[error("client error: {message}")]
    Client {
        message: String,
        status: Option<u16>,
        details: Option<ErrorDetails>,
    },

    /// Parser/binder/missing-table/missing-property errors, regardless of
    /// the HTTP status that carried them. Never retried, ever.
    #[error("query syntax error: {message}")]
    Syntax {
        message: String,
        status: Option<u16>,
        details: Option<ErrorDetails>,
    },

    /// 500 and other unclassified 5xx. Retriable.
    #[error("server error: {message}")]
    Server {
        message: String,
        status: Option<u16>,
        details: Option<ErrorDetails>,
    },

    /// Exhausted all retries for a retriable error.
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    /// Allocation manager: no capacity, parent not found, or autoscaling
    /// refused.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Client factory: shared-master undiscoverable, or ALB unhealthy with
    /// fallback disallowed.
    #[error("routing failed: {0}")]
    Routing(String),

    /// Startup-time failure: missing base URL, unparseable tier manifest.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Subgraph service: policy rejection (tier limits, disabled feature,
    /// invalid parent/name) distinct from a backend-surfaced failure.
    #[error("subgraph operation rejected: {0}")]
    Subgraph(String),
}

impl Error {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Transient { .. } | Error::Timeout { .. } | Error::Server { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Transient { status, .. }
            | Error::Client { status, .. }
            | Error::Syntax { status, .. }
            | Error::Server { status, .. } => *status,
            _ => None,
        }
    }

    pub fn client(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Client {
            message: message.into(),
            status,
            details: None,
        }
    }

    pub fn transient(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Transient {
            message: message.into(),
            status,
            details: None,
        }
    }

    pub fn server(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Server {
            message: message.into(),
            status,
            details: None,
        }
    }

    pub fn syntax(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Syntax {
            message: message.into(),
            status,
            details: None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout {
                elapsed: Duration::default(),
            }
        } else if err.is_connect() {
            Error::transient(err.to_string(), None)
        } else {
            Error::transient(err.to_string(), err.status().map(|s| s.as_u16()))
        }
    }
}
