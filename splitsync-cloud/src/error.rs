//! Remote API error types.

use thiserror::Error;

/// Result type for remote API calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// How the sync loop should react to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry later with backoff: network trouble, timeouts, 5xx, 408, 429.
    Transient,
    /// The server refused the request: surface as a conflict, do not retry.
    Rejected,
    /// Credentials are missing or refused: stop draining, keep the operation pending.
    Unauthorized,
}

/// Errors that can occur talking to the remote API.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CloudError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network(_) => FailureClass::Transient,
            Self::Status { status, .. } => match *status {
                401 => FailureClass::Unauthorized,
                408 | 429 => FailureClass::Transient,
                500..=599 => FailureClass::Transient,
                _ => FailureClass::Rejected,
            },
            Self::AuthRequired | Self::AuthFailed(_) => FailureClass::Unauthorized,
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    FailureClass::Transient
                } else if let Some(status) = e.status() {
                    Self::Status {
                        status: status.as_u16(),
                        body: String::new(),
                    }
                    .class()
                } else {
                    FailureClass::Transient
                }
            }
            Self::Serialization(_) | Self::Protocol(_) | Self::Config(_) => FailureClass::Rejected,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// HTTP status of a server rejection, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
