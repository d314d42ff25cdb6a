//! Error types for harvest-dl
//!
//! The taxonomy mirrors how failures propagate through the crate:
//! - [`Error::Validation`] is returned synchronously before any I/O happens
//! - [`Error::Transport`] is scoped to one task or one page fetch
//! - [`Error::Parse`] terminates the extraction job that produced it
//! - [`Error::Sink`] terminates every task bound to the failing archive
//! - [`Error::Cancelled`] is a clean stop, never reported as a failure

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::TaskId;

/// Result type alias for harvest-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for harvest-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before any I/O (bad or relative URL, empty filename)
    #[error("validation error: {0}")]
    Validation(String),

    /// Network-level failure for a single request
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed JSON or a missing embedded sub-document
    #[error("parse error: {0}")]
    Parse(String),

    /// Archive sink failure (write error, disk full, closed container)
    #[error("archive sink {container} failed: {reason}")]
    Sink {
        /// The ZIP container the sink writes to
        container: PathBuf,
        /// Human-readable failure reason
        reason: String,
    },

    /// Cooperative cancellation observed at a continuation point
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "site.base_url")
        key: Option<String>,
    },

    /// Task not found in the task list
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Operation not allowed in the task's current state
    #[error("cannot {operation} task {id} in state {current_state}")]
    InvalidState {
        /// The task the operation targeted
        id: TaskId,
        /// The attempted operation (e.g., "resume")
        operation: String,
        /// The state that prevents it
        current_state: String,
    },

    /// Downloader is shutting down and does not accept new work
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Transport-level failures reported by a [`crate::transport::Transport`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    Status {
        /// HTTP status code
        status: u16,
        /// The URL that produced the status
        url: String,
    },

    /// DNS, connect or TLS failure
    #[error("connection failed: {0}")]
    Connect(String),

    /// Request exceeded its deadline
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Redirect target rejected by the redirect policy
    #[error("redirect from {from} to {to} blocked by policy")]
    RedirectBlocked {
        /// URL that issued the redirect
        from: String,
        /// Location the server redirected to
        to: String,
    },

    /// Redirect chain revisited a URL
    #[error("redirect loop detected at {0}")]
    RedirectLoop(String),

    /// Redirect chain exceeded the configured hop limit
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),

    /// Body stream failed mid-transfer
    #[error("body read failed: {0}")]
    Body(String),

    /// Anything else the transport could not classify
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Classification tag attached to every reported failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected input
    Validation,
    /// Network failure
    Transport,
    /// Malformed payload
    Parse,
    /// Archive sink failure
    Sink,
    /// Clean cancellation
    Cancelled,
    /// Local I/O, configuration or state errors
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Transport => "transport",
            ErrorClass::Parse => "parse",
            ErrorClass::Sink => "sink",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Classification tag for this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_) => ErrorClass::Validation,
            Error::Transport(_) => ErrorClass::Transport,
            Error::Parse(_) | Error::Serialization(_) => ErrorClass::Parse,
            Error::Sink { .. } => ErrorClass::Sink,
            Error::Cancelled => ErrorClass::Cancelled,
            Error::Config { .. }
            | Error::NotFound(_)
            | Error::InvalidState { .. }
            | Error::ShuttingDown
            | Error::Io(_) => ErrorClass::Internal,
        }
    }

    /// Whether this error is a cooperative stop rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Shorthand for a sink failure
    pub(crate) fn sink(container: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Sink {
            container: container.into(),
            reason: reason.into(),
        }
    }
}

/// A failure as reported to the presentation surface: tag plus free text
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Classification tag
    pub class: ErrorClass,
    /// Human-readable detail
    pub detail: String,
}

impl From<&Error> for FailureReport {
    fn from(error: &Error) -> Self {
        Self {
            class: error.class(),
            detail: error.to_string(),
        }
    }
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.class, self.detail)
    }
}
