//! Core traits and types for APDU exchanges with ISO-DEP tags
//!
//! This crate provides the foundational types used to talk to a smart card
//! application over a contactless (ISO/IEC 14443-4) link.
//!
//! ## Overview
//!
//! - Creating and parsing APDU commands and responses
//! - Encoding and decoding the one-byte-length TLV records used by card applets
//! - Talking to a tag through the asynchronous [`IsoDepTransport`] trait
//! - Reassembling chained responses ("more data available", `61 XX`)
//! - Cooperative cancellation of in-flight exchanges with [`CancelToken`]
//!
//! Everything here is single-threaded: transports, locks and tokens are
//! reference counted with `Rc` and meant to be driven from a local executor.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod cancel;
pub mod command;
pub mod error;
pub mod processor;
pub mod response;
pub mod tlv;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use cancel::CancelToken;
pub use command::Command;
pub use error::{Error, ResultExt};
pub use processor::SendRemainingProcessor;
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{IsoDepTransport, TagLock, TransportError, WeakTagLock};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut, Error, ResultExt};

    pub use crate::Command;

    pub use crate::Response;
    pub use crate::response::status::{StatusWord, common as status};

    pub use crate::tlv::{self, Tlv};

    pub use crate::transport::{IsoDepTransport, TagLock, TransportError};

    pub use crate::processor::SendRemainingProcessor;

    pub use crate::cancel::CancelToken;
}
