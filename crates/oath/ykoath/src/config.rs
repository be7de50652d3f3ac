//! Configuration of the OATH context

use std::path::PathBuf;
use std::time::Duration;

use ykoath_apdu_core::SendRemainingProcessor;

use crate::constants::DEFAULT_TOTP_PERIOD;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "YKOATH_CONFIG_DIR";

/// Configuration options for [`OathContext`](crate::OathContext)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OathConfig {
    /// Where per-card credential files live
    pub config_dir: PathBuf,

    /// TOTP time step used for CALCULATE ALL challenges and the validity timer
    pub totp_period: Duration,

    /// Bound on SEND REMAINING requests per exchange
    pub max_chain: Option<usize>,
}

impl Default for OathConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            totp_period: DEFAULT_TOTP_PERIOD,
            max_chain: None,
        }
    }
}

impl OathConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration directory
    pub fn with_config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self
    }

    /// Set the TOTP period
    pub const fn with_totp_period(mut self, totp_period: Duration) -> Self {
        self.totp_period = totp_period;
        self
    }

    /// Set the response chain bound
    pub const fn with_max_chain(mut self, max_chain: Option<usize>) -> Self {
        self.max_chain = max_chain;
        self
    }

    /// Chained response processor for this configuration
    pub const fn processor(&self) -> SendRemainingProcessor {
        SendRemainingProcessor::new().with_max_chain(self.max_chain)
    }
}

/// `$YKOATH_CONFIG_DIR`, else the platform configuration directory, else
/// `.ykoath` in the working directory
pub fn default_config_dir() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(path);
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("ykoath");
    }
    PathBuf::from(".ykoath")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = OathConfig::new()
            .with_config_dir("/tmp/ykoath-test")
            .with_totp_period(Duration::from_secs(60))
            .with_max_chain(Some(8));
        assert_eq!(config.config_dir, PathBuf::from("/tmp/ykoath-test"));
        assert_eq!(config.totp_period.as_secs(), 60);
        assert_eq!(config.processor().max_chain(), Some(8));
        assert_eq!(OathConfig::default().totp_period.as_secs(), 30);
    }
}
