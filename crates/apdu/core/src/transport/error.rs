//! Error types for the ISO-DEP transport layer

use crate::response::error::ResponseError;

/// Transport-level failure
///
/// These are always terminal for the exchange that hit them and are never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The exchange was cancelled through its token
    #[error("Operation cancelled")]
    Cancelled,

    /// The tag left the field
    #[error("Tag is gone")]
    TagGone,

    /// Failed to exchange bytes with the tag
    #[error("Transmission failed: {0}")]
    Transmission(String),

    /// Failed to acquire exclusive access to the tag
    #[error("Failed to lock tag: {0}")]
    Lock(String),

    /// The tag answered with something that is not an APDU response
    #[error(transparent)]
    Malformed(#[from] ResponseError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error stems from cancellation
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
