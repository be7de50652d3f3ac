//! Error types for the PC/SC access layer

use ykoath_apdu_core::TransportError;

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// No readers available
    #[error("No readers available")]
    NoReadersAvailable,

    /// Reader not found
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// Blocking task failed to complete
    #[error("Background task failed: {0}")]
    Task(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl From<PcscError> for TransportError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::Pcsc(pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard)
            | PcscError::NoCard(_) => Self::TagGone,
            other => Self::Transmission(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_card_maps_to_tag_gone() {
        let error: TransportError = PcscError::Pcsc(pcsc::Error::RemovedCard).into();
        assert_eq!(error, TransportError::TagGone);

        let error: TransportError = PcscError::NoCard("ACR122".into()).into();
        assert_eq!(error, TransportError::TagGone);

        let error: TransportError = PcscError::Other("boom".into()).into();
        assert_eq!(error, TransportError::Transmission("boom".into()));
    }
}
