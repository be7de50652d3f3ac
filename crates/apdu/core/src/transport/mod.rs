//! Transport abstraction over an ISO-DEP (ISO/IEC 14443-4) link
//!
//! A transport exchanges raw APDUs with one tag and arbitrates exclusive
//! access to it. The exclusive lock is a shared resource: whoever holds a
//! [`TagLock`] handle keeps the tag reserved, and the lock is released when the
//! last handle is dropped.

mod error;

use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::{CancelToken, Command, Response};

pub use error::TransportError;

/// Asynchronous, single-threaded ISO-DEP transport
#[async_trait(?Send)]
pub trait IsoDepTransport: fmt::Debug {
    /// Exchange raw bytes with the tag
    ///
    /// Implementations should let an already issued exchange complete even
    /// if `cancel` fires meanwhile.
    async fn do_transceive(
        &self,
        command: &[u8],
        cancel: &CancelToken,
    ) -> Result<Bytes, TransportError>;

    /// Send a command and parse the response
    async fn transceive(
        &self,
        command: &Command,
        cancel: &CancelToken,
    ) -> Result<Response, TransportError> {
        cancel.check()?;

        let raw = command.to_bytes();
        trace!(command = %hex::encode(&raw), "Transceive");

        let data = self.do_transceive(&raw, cancel).await?;
        trace!(response = %hex::encode(&data), "Received");

        // A late result of a cancelled exchange is dropped
        cancel.check()?;
        Ok(Response::from_bytes(&data)?)
    }

    /// The lock handle currently held by anyone, if the tag is locked
    fn lock(&self) -> Option<TagLock>;

    /// Acquire exclusive access to the tag
    async fn acquire_lock(&self, cancel: &CancelToken) -> Result<TagLock, TransportError>;
}

/// Shared handle of an exclusive tag lock
///
/// The wrapped guard is dropped, and the lock released, when the last clone
/// goes away.
#[derive(Clone)]
pub struct TagLock {
    guard: Rc<dyn Any>,
}

impl TagLock {
    /// Wrap a guard whose drop releases the lock
    pub fn new(guard: impl Any) -> Self {
        Self {
            guard: Rc::new(guard),
        }
    }

    /// Weak reference that does not keep the lock alive
    pub fn downgrade(&self) -> WeakTagLock {
        WeakTagLock {
            guard: Some(Rc::downgrade(&self.guard)),
        }
    }

    /// Whether both handles refer to the same lock
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.guard, &other.guard)
    }
}

impl fmt::Debug for TagLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagLock")
            .field("handles", &Rc::strong_count(&self.guard))
            .finish()
    }
}

/// Weak counterpart of [`TagLock`], kept by transports to implement
/// [`IsoDepTransport::lock`]
#[derive(Debug, Clone, Default)]
pub struct WeakTagLock {
    guard: Option<Weak<dyn Any>>,
}

impl WeakTagLock {
    /// Upgrade to a strong handle while the lock is still held
    pub fn upgrade(&self) -> Option<TagLock> {
        self.guard
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|guard| TagLock { guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Guard(Rc<Cell<bool>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn test_lock_released_with_last_handle() {
        let released = Rc::new(Cell::new(false));
        let lock = TagLock::new(Guard(released.clone()));
        let weak = lock.downgrade();

        let other = weak.upgrade().unwrap();
        assert!(lock.ptr_eq(&other));
        drop(lock);
        assert!(!released.get());

        drop(other);
        assert!(released.get());
        assert!(weak.upgrade().is_none());
        assert!(WeakTagLock::default().upgrade().is_none());
    }
}
