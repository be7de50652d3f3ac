//! ISO-DEP transport over a PC/SC reader
//!
//! Blocking PC/SC calls run on tokio's blocking pool. The exclusive tag lock
//! maps to reconnecting the card in exclusive share mode; dropping the last
//! [`TagLock`] handle reconnects in the configured share mode.

use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pcsc::{Card, Context, Disposition};
use tracing::{debug, warn};
use ykoath_apdu_core::{CancelToken, IsoDepTransport, TagLock, TransportError, WeakTagLock};

use crate::config::{PcscConfig, ShareMode};
use crate::error::PcscError;

struct Connection {
    card: Card,
    mode: ShareMode,
}

/// Reader connection shared with blocking tasks
struct Link {
    context: Context,
    reader: CString,
    name: String,
    config: PcscConfig,
    connection: Mutex<Option<Connection>>,
}

impl Link {
    fn connect(&self, mode: ShareMode) -> Result<Connection, PcscError> {
        match self
            .context
            .connect(&self.reader, mode.into(), self.config.protocols)
        {
            Ok(card) => Ok(Connection { card, mode }),
            Err(pcsc::Error::NoSmartcard) => Err(PcscError::NoCard(self.name.clone())),
            Err(pcsc::Error::UnknownReader) => Err(PcscError::ReaderNotFound(self.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn transmit(&self, command: &[u8]) -> Result<Bytes, PcscError> {
        let mut guard = self.connection.lock();
        if guard.is_none() {
            *guard = Some(self.connect(self.config.share_mode)?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(PcscError::NoCard(self.name.clone()));
        };

        let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        match connection.card.transmit(command, &mut buffer) {
            Ok(response) => Ok(Bytes::copy_from_slice(response)),
            Err(pcsc::Error::ResetCard) if self.config.auto_reconnect => {
                debug!(reader = %self.name, "Card was reset, reconnecting");
                connection.card.reconnect(
                    connection.mode.into(),
                    self.config.protocols,
                    Disposition::LeaveCard,
                )?;
                let response = connection.card.transmit(command, &mut buffer)?;
                Ok(Bytes::copy_from_slice(response))
            }
            Err(e) => {
                if matches!(e, pcsc::Error::ResetCard | pcsc::Error::RemovedCard) {
                    *guard = None;
                }
                Err(e.into())
            }
        }
    }

    fn set_mode(&self, mode: ShareMode) -> Result<(), PcscError> {
        let mut guard = self.connection.lock();
        match guard.as_mut() {
            Some(connection) if connection.mode == mode => Ok(()),
            Some(connection) => {
                connection
                    .card
                    .reconnect(mode.into(), self.config.protocols, Disposition::LeaveCard)?;
                connection.mode = mode;
                Ok(())
            }
            None => {
                *guard = Some(self.connect(mode)?);
                Ok(())
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            let _ = connection.card.disconnect(Disposition::LeaveCard);
        }
    }
}

/// Releases exclusive access when the last [`TagLock`] handle drops
struct ExclusiveGuard {
    link: Arc<Link>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        let link = self.link.clone();
        let release = move || {
            if let Err(e) = link.set_mode(link.config.share_mode) {
                debug!(reader = %link.name, error = %e, "Failed to release exclusive access");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

/// A tag sitting on a PC/SC reader
pub struct PcscTag {
    link: Arc<Link>,
    lock: RefCell<WeakTagLock>,
}

impl fmt::Debug for PcscTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTag")
            .field("reader", &self.link.name)
            .field("config", &self.link.config)
            .field("locked", &self.lock().is_some())
            .finish()
    }
}

impl PcscTag {
    pub(crate) fn new(
        context: Context,
        reader_name: &str,
        config: PcscConfig,
    ) -> Result<Self, PcscError> {
        let reader = CString::new(reader_name)
            .map_err(|_| PcscError::ReaderNotFound(reader_name.to_string()))?;
        Ok(Self {
            link: Arc::new(Link {
                context,
                reader,
                name: reader_name.to_string(),
                config,
                connection: Mutex::new(None),
            }),
            lock: RefCell::new(WeakTagLock::default()),
        })
    }

    /// Get the reader name
    pub fn reader_name(&self) -> &str {
        &self.link.name
    }

    /// Get the ATR of the current card
    pub fn atr(&self) -> Result<Vec<u8>, PcscError> {
        let mut guard = self.link.connection.lock();
        if guard.is_none() {
            *guard = Some(self.link.connect(self.link.config.share_mode)?);
        }
        match guard.as_ref() {
            Some(connection) => Ok(connection
                .card
                .get_attribute_owned(pcsc::Attribute::AtrString)?),
            None => Err(PcscError::NoCard(self.link.name.clone())),
        }
    }
}

#[async_trait(?Send)]
impl IsoDepTransport for PcscTag {
    async fn do_transceive(
        &self,
        command: &[u8],
        _cancel: &CancelToken,
    ) -> Result<Bytes, TransportError> {
        let link = self.link.clone();
        let command = command.to_vec();
        tokio::task::spawn_blocking(move || link.transmit(&command))
            .await
            .map_err(|e| TransportError::Transmission(e.to_string()))?
            .map_err(Into::into)
    }

    fn lock(&self) -> Option<TagLock> {
        self.lock.borrow().upgrade()
    }

    async fn acquire_lock(&self, cancel: &CancelToken) -> Result<TagLock, TransportError> {
        if let Some(lock) = self.lock() {
            return Ok(lock);
        }
        cancel.check()?;

        let link = self.link.clone();
        tokio::task::spawn_blocking(move || link.set_mode(ShareMode::Exclusive))
            .await
            .map_err(|e| TransportError::Lock(e.to_string()))?
            .map_err(|e| {
                warn!(reader = %self.link.name, error = %e, "Failed to lock tag");
                match TransportError::from(e) {
                    TransportError::TagGone => TransportError::TagGone,
                    other => TransportError::Lock(other.to_string()),
                }
            })?;

        let lock = TagLock::new(ExclusiveGuard {
            link: self.link.clone(),
        });
        // Dropping the handle on cancellation gives the card back
        cancel.check()?;

        *self.lock.borrow_mut() = lock.downgrade();
        debug!(reader = %self.link.name, "Tag locked");
        Ok(lock)
    }
}
