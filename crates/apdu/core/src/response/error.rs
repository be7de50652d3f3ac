//! Error types specific to APDU responses

/// Malformed response error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    /// Fewer than two bytes, no room for a status word
    #[error("Response too short: {0} bytes")]
    Incomplete(usize),
}
