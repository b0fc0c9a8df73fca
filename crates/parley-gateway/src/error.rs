//! Gateway error taxonomy.

use std::fmt;

use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failure of a remote call, classified by how the caller should react.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Target entity is absent server-side. Not retriable.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network failure, timeout, 5xx, or an unreadable response.
    /// Retriable by user action.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server rejected the input. Not retriable.
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Transport,
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Transport => "transport",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

impl GatewayError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Only transport failures are worth retrying, and only on user request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Transport(format!("request timed out: {e}"))
        } else if e.is_decode() {
            Self::Transport(format!("invalid response body: {e}"))
        } else {
            Self::Transport(e.to_string())
        }
    }
}
