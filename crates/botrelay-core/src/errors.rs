//! Error hierarchy for the relay.
//!
//! - [`LinkError`]: a write or close on a single connection failed
//! - [`RelayError`]: top-level error covering payload decoding, links and routing rules
//!
//! Transient link failures are recovered inside the broker (deregister and
//! retry); they only surface as values so callers can decide what to log.

use thiserror::Error;

/// Failure writing to or closing one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The peer is gone or the connection was already closed.
    #[error("connection closed")]
    Closed,
    /// The transport rejected the frame.
    #[error("transport error: {0}")]
    Transport(String),
}

impl LinkError {
    /// Build a transport error from any displayable source.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Top-level error type for the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A frame could not be decoded or encoded.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A connection write failed.
    #[error("{0}")]
    Link(#[from] LinkError),

    /// A routing rule pattern could not be compiled.
    #[error("invalid routing pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl RelayError {
    /// Whether the broker should treat this as a transient socket failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Link(_))
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
