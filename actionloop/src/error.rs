//! Error type shared by every pipeline.
//!
//! Variants mirror the HTTP statuses the runtime answers with; the HTTP
//! layer renders any of them as the single `{"error": ...}` envelope.

/// Alias for `Result<T, actionloop::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the init, run, forward, and stop pipelines.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input, or the child died mid-run (400).
    #[error("{0}")]
    BadRequest(String),

    /// Empty code, or re-initialization outside debug mode (403).
    #[error("{0}")]
    Forbidden(String),

    /// Unknown action hash or client identity (404).
    #[error("{0}")]
    NotFound(String),

    /// Endpoint not supported in the current proxy mode (422).
    #[error("{0}")]
    WrongMode(String),

    /// Upstream failure, compile failure, or non-JSON action output (502).
    #[error("{0}")]
    BadGateway(String),

    /// Plumbing failure inside the runtime itself (500).
    #[error("{0}")]
    Internal(String),

    /// An I/O error from extraction, logs, or process management (500).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
