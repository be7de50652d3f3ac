use ykoath_apdu_core::StatusWord;

/// Result type for YKOATH operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for YKOATH operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// APDU exchange errors
    #[error(transparent)]
    Apdu(#[from] ykoath_apdu_core::Error),

    /// Transport-related errors
    #[error(transparent)]
    Transport(#[from] ykoath_apdu_core::TransportError),

    /// Card answered with an error status
    #[error("Status error {0}: {desc}", desc = .0.description())]
    Status(StatusWord),

    /// Credential file access
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Credential file encoding
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// No tag holds the card
    #[error("Card is not present")]
    NotPresent,

    /// The card hasn't reported its access key algorithm
    #[error("Authentication algorithm is not known yet")]
    UnknownAlgorithm,

    /// Key of an unusable length
    #[error("Invalid HMAC key length")]
    InvalidKeyLength,

    /// Code length outside 6..=8
    #[error("Invalid number of digits: {0}")]
    InvalidDigits(u8),

    /// Credential that can't be stored
    #[error("Invalid token: {0}")]
    InvalidToken(&'static str),

    /// The operation could not be queued
    #[error("Operation was not submitted")]
    NotSubmitted,

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error stands for cancellation rather than failure
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Apdu(e) => e.is_cancelled(),
            Self::Transport(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message() {
        let error = Error::Status(StatusWord::new(0x67, 0x00));
        assert_eq!(error.to_string(), "Status error 67 00: Wrong length");
    }
}
