//! Tag presence events reported by the monitor

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Presence change of a tag on a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEvent {
    /// A tag entered the field of a reader
    Present {
        /// Reader name, used as the tag path
        reader: String,
        /// ATR reported by the reader
        atr: Vec<u8>,
        /// Whether the tag can carry APDUs
        iso_dep: bool,
    },
    /// The tag left the reader, or the reader went away
    Gone {
        /// Reader name
        reader: String,
    },
}

impl TagEvent {
    /// Name of the reader the event refers to
    pub fn reader(&self) -> &str {
        match self {
            Self::Present { reader, .. } | Self::Gone { reader } => reader,
        }
    }
}

/// Sender for tag events
pub type TagEventSender = Sender<TagEvent>;
/// Receiver for tag events
pub type TagEventReceiver = Receiver<TagEvent>;

/// Create an unbounded channel for tag events
pub fn tag_event_channel() -> (TagEventSender, TagEventReceiver) {
    unbounded()
}
