use std::fmt;

/// How a caller with a retry budget should treat a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network blip or rate limit: retry with backoff.
    Transient,
    /// The store itself is down (5xx): retry up to a ceiling, then give up.
    Unavailable,
    /// The store refused the request or returned something unusable.
    Permanent,
}

/// Errors that an attribute-store backend may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network or transport failure (connect, timeout, reset).
    Transport(String),
    /// The store throttled the request (HTTP 429 or GraphQL `THROTTLED`).
    RateLimited(String),
    /// The store answered with a server-side failure.
    Unavailable { status: Option<u16>, message: String },
    /// Schema/validation rejection: 4xx, GraphQL errors, mutation userErrors,
    /// or an unknown entity.
    Rejected { status: Option<u16>, message: String },
    /// A response payload or stored value could not be decoded.
    Decode(String),
    /// The backend is misconfigured (missing counter attribute, bad client).
    Config(String),
}

impl StoreError {
    pub fn class(&self) -> FailureClass {
        match self {
            StoreError::Transport(_) | StoreError::RateLimited(_) => FailureClass::Transient,
            StoreError::Unavailable { .. } => FailureClass::Unavailable,
            StoreError::Rejected { .. } | StoreError::Decode(_) | StoreError::Config(_) => {
                FailureClass::Permanent
            }
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transport(msg) => write!(f, "transport error: {msg}"),
            StoreError::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            StoreError::Unavailable {
                status: Some(s),
                message,
            } => write!(f, "store unavailable status={s}: {message}"),
            StoreError::Unavailable {
                status: None,
                message,
            } => write!(f, "store unavailable: {message}"),
            StoreError::Rejected {
                status: Some(s),
                message,
            } => write!(f, "store rejected request status={s}: {message}"),
            StoreError::Rejected {
                status: None,
                message,
            } => write!(f, "store rejected request: {message}"),
            StoreError::Decode(msg) => write!(f, "decode error: {msg}"),
            StoreError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
