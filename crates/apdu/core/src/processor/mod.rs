//! Response chaining for card applets that answer in fragments
//!
//! When a response does not fit a single frame the card returns `61 XX` and
//! keeps the rest until the host asks for it. [`SendRemainingProcessor`]
//! wraps one logical exchange: it keeps issuing `SEND REMAINING` and
//! concatenates the fragments until the card reports a final status.

use bytes::BytesMut;
use tracing::{Level, debug, info, trace, warn};

use crate::{CancelToken, Command, Error, Response, transport::IsoDepTransport};

/// Fetches the next fragment of a chained response
pub const SEND_REMAINING: Command = Command::new(0x00, 0xA5, 0x00, 0x00);

/// Reassembles chained responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendRemainingProcessor {
    max_chain: Option<usize>,
}

impl SendRemainingProcessor {
    /// Processor without a bound on the number of fragments
    pub const fn new() -> Self {
        Self { max_chain: None }
    }

    /// Fail with [`Error::ChainLimitExceeded`] after `max` follow-up requests
    pub const fn with_max_chain(mut self, max: Option<usize>) -> Self {
        self.max_chain = max;
        self
    }

    /// Configured bound on follow-up requests
    pub const fn max_chain(&self) -> Option<usize> {
        self.max_chain
    }

    /// Run one logical exchange
    ///
    /// Returns the accumulated payload with the final status word, whatever
    /// that status is. Transport errors are returned as they happen.
    pub async fn exchange(
        &self,
        transport: &dyn IsoDepTransport,
        command: &Command,
        cancel: &CancelToken,
    ) -> Result<Response, Error> {
        let mut response = transport.transceive(command, cancel).await?;
        let mut buffer = BytesMut::new();
        let mut requests = 0usize;

        while response.more_data_available() {
            if self.max_chain.is_some_and(|max| requests >= max) {
                warn!(requests, "Response chain too long");
                return Err(Error::ChainLimitExceeded);
            }
            trace!(
                remaining = response.status().remaining_bytes(),
                "More data available"
            );
            buffer.extend_from_slice(response.payload());
            response = transport.transceive(&SEND_REMAINING, cancel).await?;
            requests += 1;
        }

        let status = response.status();
        log_status(command, &response);

        if requests == 0 {
            return Ok(response);
        }
        buffer.extend_from_slice(response.payload());
        Ok(Response::new(buffer.freeze(), status))
    }
}

fn log_status(command: &Command, response: &Response) {
    let status = response.status();
    let level = status.tracing_level();
    if level == Level::DEBUG {
        debug!(ins = command.ins, %status, len = response.payload().len(), "Exchange complete");
    } else if level == Level::INFO {
        info!(ins = command.ins, %status, "{}", status.description());
    } else {
        warn!(ins = command.ins, %status, "{}", status.description());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use bytes::Bytes;
    use futures::executor::block_on;
    use hex_literal::hex;

    const LIST: Command = Command::new(0x00, 0xA1, 0x00, 0x00);

    #[test]
    fn test_reassembles_fragments_in_order() {
        let transport = MockTransport::new()
            .with_response(hex!("7203210102 6142").to_vec())
            .with_response(hex!("7203220304 6101").to_vec())
            .with_response(hex!("7201FF 9000").to_vec());

        let response = block_on(SendRemainingProcessor::new().exchange(
            &transport,
            &LIST,
            &CancelToken::new(),
        ))
        .unwrap();

        assert!(response.is_success());
        assert_eq!(
            response.payload().as_ref(),
            hex!("7203210102 7203220304 7201FF")
        );

        let commands = transport.commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].as_ref(), hex!("00A10000"));
        assert_eq!(commands[1].as_ref(), hex!("00A50000"));
        assert_eq!(commands[2].as_ref(), hex!("00A50000"));
    }

    #[test]
    fn test_final_error_status_is_returned() {
        let transport = MockTransport::new()
            .with_response(hex!("0102 6100").to_vec())
            .with_response(hex!("6A80").to_vec());

        let response = block_on(SendRemainingProcessor::new().exchange(
            &transport,
            &LIST,
            &CancelToken::new(),
        ))
        .unwrap();
        assert!(response.status().is_wrong_syntax());
        assert_eq!(response.payload().as_ref(), hex!("0102"));
    }

    #[test]
    fn test_chain_limit() {
        let transport = MockTransport::new()
            .with_response(hex!("01 6101").to_vec())
            .with_response(hex!("02 6101").to_vec())
            .with_response(hex!("03 9000").to_vec());

        let processor = SendRemainingProcessor::new().with_max_chain(Some(1));
        let result = block_on(processor.exchange(&transport, &LIST, &CancelToken::new()));
        assert_eq!(result, Err(Error::ChainLimitExceeded));
        assert_eq!(transport.commands().len(), 2);
    }

    #[test]
    fn test_transport_error_stops_chain() {
        let transport = MockTransport::new().with_response(hex!("01 6101").to_vec());
        transport.push_error(crate::TransportError::TagGone);

        let result = block_on(SendRemainingProcessor::new().exchange(
            &transport,
            &LIST,
            &CancelToken::new(),
        ));
        assert_eq!(result.unwrap_err().transport(), Some(&crate::TransportError::TagGone));
    }

    #[test]
    fn test_cancelled_before_sending() {
        let transport = MockTransport::new().with_response(Bytes::from_static(&[0x90, 0x00]));
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = block_on(SendRemainingProcessor::new().exchange(&transport, &LIST, &cancel));
        assert!(result.unwrap_err().is_cancelled());
        assert!(transport.commands().is_empty());
    }
}
