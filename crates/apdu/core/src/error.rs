//! Core error type for all APDU operations
//!
//! This module provides a centralized error type used throughout the
//! `ykoath_apdu_core` crate.

use crate::response::error::ResponseError;
use crate::response::status::StatusWord;
use crate::transport::TransportError;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Transport failure, including cancellation and tag loss
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed response
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Status error from response
    #[error("Status error {status}: {}", status.description())]
    Status {
        /// Status word that caused the error
        status: StatusWord,
    },

    /// Invalid command length
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Chain limit exceeded
    #[error("Chain limit exceeded")]
    ChainLimitExceeded,

    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },

    /// Generic dynamic error with string message
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new error with a dynamic message
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::Message(message.into())
    }

    /// Create a new status error
    pub const fn status(status: StatusWord) -> Self {
        Self::Status { status }
    }

    /// The transport error at the root of this error, if any
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Context { source, .. } => source.transport(),
            _ => None,
        }
    }

    /// Whether this error was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.transport(), Some(TransportError::Cancelled))
    }
}

/// Extension trait for Result with APDU Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_transport_cause() {
        let result: Result<(), TransportError> = Err(TransportError::Cancelled);
        let err = result.context("Failed to transmit LIST").unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Failed to transmit LIST: Operation cancelled");
    }

    #[test]
    fn test_status_message() {
        let err = Error::status(StatusWord::new(0x6A, 0x80));
        assert_eq!(err.to_string(), "Status error 6A 80: Wrong syntax");
        assert!(err.transport().is_none());
    }
}
