//! Scripted transport for tests
//!
//! [`MockTransport`] answers each exchange with the next scripted response and
//! records every command it was sent.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::transport::{IsoDepTransport, TagLock, TransportError, WeakTagLock};
use crate::CancelToken;

/// Transport replaying scripted responses
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: RefCell<VecDeque<Result<Bytes, TransportError>>>,
    commands: RefCell<Vec<Bytes>>,
    lock: RefCell<WeakTagLock>,
    lock_error: RefCell<Option<TransportError>>,
    acquisitions: Cell<usize>,
}

impl MockTransport {
    /// Create a transport with nothing scripted
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a raw response, status word included
    pub fn with_response(self, raw: impl Into<Bytes>) -> Self {
        self.push_response(raw);
        self
    }

    /// Script a `90 00` response carrying `payload`
    pub fn with_success(self, payload: &[u8]) -> Self {
        let mut raw = BytesMut::with_capacity(payload.len() + 2);
        raw.put_slice(payload);
        raw.put_u16(0x9000);
        self.with_response(raw.freeze())
    }

    /// Script a raw response on a shared transport
    pub fn push_response(&self, raw: impl Into<Bytes>) {
        self.responses.borrow_mut().push_back(Ok(raw.into()));
    }

    /// Script a transport failure
    pub fn push_error(&self, error: TransportError) {
        self.responses.borrow_mut().push_back(Err(error));
    }

    /// Make the next lock acquisition fail
    pub fn fail_lock(&self, error: TransportError) {
        *self.lock_error.borrow_mut() = Some(error);
    }

    /// Commands sent so far, serialized
    pub fn commands(&self) -> Vec<Bytes> {
        self.commands.borrow().clone()
    }

    /// Number of scripted responses not consumed yet
    pub fn pending_responses(&self) -> usize {
        self.responses.borrow().len()
    }

    /// Number of successful lock acquisitions
    pub fn lock_acquisitions(&self) -> usize {
        self.acquisitions.get()
    }

    /// Whether a lock handle is alive
    pub fn is_locked(&self) -> bool {
        self.lock.borrow().upgrade().is_some()
    }
}

#[async_trait(?Send)]
impl IsoDepTransport for MockTransport {
    async fn do_transceive(
        &self,
        command: &[u8],
        _cancel: &CancelToken,
    ) -> Result<Bytes, TransportError> {
        self.commands
            .borrow_mut()
            .push(Bytes::copy_from_slice(command));
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Other("No response scripted".into())))
    }

    fn lock(&self) -> Option<TagLock> {
        self.lock.borrow().upgrade()
    }

    async fn acquire_lock(&self, cancel: &CancelToken) -> Result<TagLock, TransportError> {
        cancel.check()?;
        if let Some(error) = self.lock_error.borrow_mut().take() {
            return Err(error);
        }
        if let Some(lock) = self.lock() {
            return Ok(lock);
        }
        let lock = TagLock::new(());
        *self.lock.borrow_mut() = lock.downgrade();
        self.acquisitions.set(self.acquisitions.get() + 1);
        Ok(lock)
    }
}
