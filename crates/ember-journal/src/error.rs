//! Error types for journal operations.

use ember_core::context::ContextError;

/// Errors from journal serialization, stream decoding, and replay.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The stream ended cleanly at an entry boundary.
    #[error("journal stream closed")]
    ShortRead,

    /// Framing violation: bad length word, checksum mismatch, truncated
    /// record, or an undecodable entry body. The stream must be aborted.
    #[error("malformed journal stream: {0}")]
    Malformed(String),

    /// Transport failure while reading the stream.
    #[error("journal stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize an entry.
    #[error("entry serialization failed: {0}")]
    Serialization(String),

    /// Invalid journal configuration.
    #[error("invalid journal configuration: {0}")]
    InvalidConfig(String),
}

impl JournalError {
    /// Returns true for the clean end-of-stream case.
    #[must_use]
    pub fn is_short_read(&self) -> bool {
        matches!(self, Self::ShortRead)
    }

    /// Maps the error onto the coarse [`ContextError`] taxonomy used by
    /// execution contexts.
    #[must_use]
    pub fn to_context_error(&self) -> ContextError {
        match self {
            Self::ShortRead => ContextError::Transport("stream closed".to_string()),
            Self::Io(e) => ContextError::Transport(e.to_string()),
            Self::Malformed(m) => ContextError::Framing(m.clone()),
            Self::Serialization(m) | Self::InvalidConfig(m) => ContextError::Generic(m.clone()),
        }
    }
}
