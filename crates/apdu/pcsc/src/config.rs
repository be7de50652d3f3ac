//! Configuration options for the PC/SC access layer

use std::time::Duration;

use pcsc::{Protocols as PcscProtocols, ShareMode as PcscShareMode};

/// Sharing mode for card connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Exclusive access to the card
    Exclusive,
    /// Shared access to the card (default)
    Shared,
    /// Direct connection to the reader
    Direct,
}

impl From<ShareMode> for PcscShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Exclusive => Self::Exclusive,
            ShareMode::Shared => Self::Shared,
            ShareMode::Direct => Self::Direct,
        }
    }
}

/// Configuration options for PC/SC tags
#[derive(Debug, Clone)]
pub struct PcscConfig {
    /// Sharing mode used while the tag is not locked
    pub share_mode: ShareMode,

    /// Preferred protocols for card communication
    pub protocols: PcscProtocols,

    /// Reconnect once if the card was reset under us
    pub auto_reconnect: bool,

    /// How long the presence monitor waits for a reader state change
    pub poll_interval: Duration,
}

impl Default for PcscConfig {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            protocols: PcscProtocols::ANY,
            auto_reconnect: true,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl PcscConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sharing mode
    pub const fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }

    /// Set the preferred protocols
    pub const fn with_protocols(mut self, protocols: PcscProtocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Set whether to automatically reconnect
    pub const fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Set the presence monitor poll interval
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = PcscConfig::new()
            .with_share_mode(ShareMode::Exclusive)
            .with_auto_reconnect(false)
            .with_poll_interval(Duration::from_millis(100));
        assert_eq!(config.share_mode, ShareMode::Exclusive);
        assert!(!config.auto_reconnect);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.protocols, PcscProtocols::ANY);
    }
}
