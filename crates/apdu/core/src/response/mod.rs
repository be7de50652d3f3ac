//! APDU response definitions
//!
//! This module provides the response type returned by transports, and the
//! status word semantics used to interpret it.

pub mod error;
pub mod status;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use error::ResponseError;
use status::StatusWord;

/// Basic APDU response structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response payload data, empty when the card returned only a status word
    payload: Bytes,
    /// Status word
    status: StatusWord,
}

impl Response {
    /// Create a new response with payload and status
    pub fn new(payload: impl Into<Bytes>, status: impl Into<StatusWord>) -> Self {
        Self {
            payload: payload.into(),
            status: status.into(),
        }
    }

    /// Create a success response
    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, status::common::SUCCESS)
    }

    /// Create an error response from a status word
    pub fn error(status: impl Into<StatusWord>) -> Self {
        Self::new(Bytes::new(), status)
    }

    /// Parse response from raw bytes (including status word)
    pub fn from_bytes(data: &Bytes) -> Result<Self, ResponseError> {
        let len = data.len();
        if len < 2 {
            return Err(ResponseError::Incomplete(len));
        }

        let status = StatusWord::new(data[len - 2], data[len - 1]);
        let payload = data.slice(..len - 2);

        trace!(
            sw1 = format_args!("{:#04x}", status.sw1),
            sw2 = format_args!("{:#04x}", status.sw2),
            payload_len = payload.len(),
            "Parsed APDU response"
        );

        Ok(Self { payload, status })
    }

    /// Get the response payload data
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take the payload out of the response
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Get the status word
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Check if the response indicates success
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the card has more data waiting (61 XX)
    pub const fn more_data_available(&self) -> bool {
        self.status.is_more_data_available()
    }
}

impl TryFrom<Bytes> for Response {
    type Error = ResponseError;

    fn try_from(data: Bytes) -> Result<Self, ResponseError> {
        Self::from_bytes(&data)
    }
}

impl From<Response> for Bytes {
    fn from(response: Response) -> Self {
        let mut buf = BytesMut::with_capacity(response.payload.len() + 2);
        buf.put_slice(&response.payload);
        buf.put_u8(response.status.sw1);
        buf.put_u8(response.status.sw2);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_response_from_bytes() {
        let data = Bytes::copy_from_slice(&hex!("0102039000"));
        let resp = Response::from_bytes(&data).unwrap();
        assert_eq!(resp.payload().as_ref(), hex!("010203"));
        assert_eq!(resp.status(), StatusWord::new(0x90, 0x00));
        assert!(resp.is_success());

        let resp = Response::from_bytes(&Bytes::copy_from_slice(&hex!("6A80"))).unwrap();
        assert!(resp.payload().is_empty());
        assert!(resp.status().is_wrong_syntax());

        assert_eq!(
            Response::from_bytes(&Bytes::from_static(&[0x90])),
            Err(ResponseError::Incomplete(1))
        );
    }

    #[test]
    fn test_response_into_bytes() {
        let resp = Response::new(Bytes::copy_from_slice(&hex!("7101")), (0x61, 0x10));
        assert!(resp.more_data_available());
        let raw: Bytes = resp.into();
        assert_eq!(raw.as_ref(), hex!("71016110"));
    }
}
