//! Device manager for PC/SC operations

use std::fmt;

use pcsc::{Context, Scope};

use crate::config::PcscConfig;
use crate::error::PcscError;
use crate::monitor::PcscMonitor;
use crate::reader::PcscReader;
use crate::transport::PcscTag;

/// Manager for PC/SC device operations
pub struct PcscDeviceManager {
    /// PC/SC context
    context: Context,
    config: PcscConfig,
}

impl fmt::Debug for PcscDeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscDeviceManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PcscDeviceManager {
    /// Create a new PC/SC device manager
    pub fn new() -> Result<Self, PcscError> {
        Self::with_config(PcscConfig::default())
    }

    /// Create a manager whose tags and monitor use `config`
    pub fn with_config(config: PcscConfig) -> Result<Self, PcscError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context, config })
    }

    /// List all available card readers
    pub fn list_readers(&self) -> Result<Vec<PcscReader>, PcscError> {
        let readers = match self.context.list_readers_owned() {
            Ok(readers) => readers,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if readers.is_empty() {
            return Err(PcscError::NoReadersAvailable);
        }

        let mut result = Vec::with_capacity(readers.len());
        for reader_name in readers {
            let mut reader_states = vec![pcsc::ReaderState::new(
                reader_name.as_c_str(),
                pcsc::State::UNAWARE,
            )];

            match self.context.get_status_change(None, &mut reader_states) {
                Ok(()) => result.push(PcscReader::from_reader_state(&reader_states[0])),
                Err(_) => {
                    // If we can't get status, assume no card
                    result.push(PcscReader::new(
                        reader_name.to_string_lossy().into_owned(),
                        false,
                        None,
                    ));
                }
            }
        }

        Ok(result)
    }

    /// First reader holding an ISO-DEP tag
    pub fn find_iso_dep_reader(&self) -> Result<PcscReader, PcscError> {
        self.list_readers()?
            .into_iter()
            .find(PcscReader::is_iso_dep)
            .ok_or_else(|| PcscError::NoCard("any reader".into()))
    }

    /// Open the tag on a specific reader
    pub fn open_tag(&self, reader_name: &str) -> Result<PcscTag, PcscError> {
        PcscTag::new(self.context.clone(), reader_name, self.config.clone())
    }

    /// Create a presence monitor
    ///
    /// The monitor gets its own context so that stopping it does not cancel
    /// calls made through this manager.
    pub fn monitor(&self) -> Result<PcscMonitor, PcscError> {
        let context = Context::establish(Scope::User)?;
        Ok(PcscMonitor::new(context, self.config.poll_interval))
    }
}
