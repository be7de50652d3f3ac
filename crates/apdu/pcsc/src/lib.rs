//! PC/SC access layer for contactless ISO-DEP tags
//!
//! Exposes tags sitting on PC/SC readers (typically NFC readers such as the
//! ACR122U) as [`IsoDepTransport`](ykoath_apdu_core::IsoDepTransport)
//! implementations, and reports tags entering and leaving the field.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ykoath_apdu_transport_pcsc::{PcscDeviceManager, TagEvent, tag_event_channel};
//!
//! let manager = PcscDeviceManager::new()?;
//! for reader in manager.list_readers()? {
//!     println!("{} (card: {})", reader.name(), reader.has_card());
//! }
//!
//! let (tx, rx) = tag_event_channel();
//! let monitor = manager.monitor()?;
//! monitor.start(tx)?;
//! if let Ok(TagEvent::Present { reader, .. }) = rx.recv() {
//!     let tag = manager.open_tag(&reader)?;
//!     println!("{tag:?}");
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod config;
mod error;
mod event;
mod manager;
mod monitor;
mod reader;
mod transport;

pub use config::{PcscConfig, ShareMode};
pub use error::PcscError;
pub use event::{TagEvent, TagEventReceiver, TagEventSender, tag_event_channel};
pub use manager::PcscDeviceManager;
pub use monitor::PcscMonitor;
pub use reader::{PcscReader, is_iso_dep_atr};
pub use transport::PcscTag;

// Re-export some pcsc types for convenience
pub use pcsc::{Protocol, Protocols};
