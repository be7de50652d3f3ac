//! Cooperative cancellation for single-threaded exchanges
//!
//! A [`CancelToken`] is a shared flag with callbacks and wakers attached.
//! Tokens form a tree: cancelling a token cancels every child created from it,
//! which lets the owner of a group of operations abort them all at once.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, poll_fn};
use std::pin::{Pin, pin};
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::transport::TransportError;

type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct Inner {
    cancelled: Cell<bool>,
    next_id: Cell<u64>,
    callbacks: RefCell<Vec<(u64, Callback)>>,
    wakers: RefCell<Vec<Waker>>,
    children: RefCell<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        // Take everything out before running foreign code, callbacks may
        // touch this token again.
        let wakers = self.wakers.take();
        let callbacks = self.callbacks.take();
        let children = self.children.take();

        for waker in wakers {
            waker.wake();
        }
        for (_, callback) in callbacks {
            callback();
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Handle of a callback registered with [`CancelToken::on_cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

/// Shared cancellation flag
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Rc<Inner>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled together with this one
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.inner.cancelled.set(true);
        } else {
            let mut children = self.inner.children.borrow_mut();
            children.retain(|c| c.strong_count() > 0);
            children.push(Rc::downgrade(&child.inner));
        }
        child
    }

    /// Whether [`cancel`](Self::cancel) has been called on this token or an ancestor
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Cancel this token and all of its children
    ///
    /// Wakes pending [`cancelled`](Self::cancelled) futures and runs the
    /// registered callbacks. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Fail with [`TransportError::Cancelled`] if the token is cancelled
    pub fn check(&self) -> Result<(), TransportError> {
        if self.is_cancelled() {
            Err(TransportError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `callback` once when the token gets cancelled
    ///
    /// If the token is already cancelled the callback runs right away and no
    /// id is returned.
    pub fn on_cancel(&self, callback: impl FnOnce() + 'static) -> Option<CallbackId> {
        if self.is_cancelled() {
            callback();
            return None;
        }
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner
            .callbacks
            .borrow_mut()
            .push((id, Box::new(callback)));
        Some(CallbackId(id))
    }

    /// Drop a callback registered with [`on_cancel`](Self::on_cancel)
    pub fn remove_callback(&self, id: CallbackId) {
        self.inner
            .callbacks
            .borrow_mut()
            .retain(|(cb_id, _)| *cb_id != id.0);
    }

    /// Future resolving once the token is cancelled
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
        }
    }

    /// Drive `future` to completion unless the token is cancelled first
    ///
    /// The future is dropped on cancellation. Use this only for waits that
    /// are safe to abandon, such as lock acquisition.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, TransportError> {
        let mut future = pin!(future);
        let mut cancelled = pin!(self.cancelled());
        poll_fn(|cx| {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(TransportError::Cancelled));
            }
            future.as_mut().poll(cx).map(Ok)
        })
        .await
    }
}

/// Future returned by [`CancelToken::cancelled`]
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    token: CancelToken,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        let mut wakers = self.token.inner.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let token = CancelToken::new();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        token.on_cancel(move || h.set(h.get() + 1));
        let h = hits.clone();
        let id = token.on_cancel(move || h.set(h.get() + 10)).unwrap();
        token.remove_callback(id);

        token.cancel();
        token.cancel();
        assert_eq!(hits.get(), 1);
        assert!(token.check().is_err());

        // Late registration runs immediately
        let h = hits.clone();
        assert!(token.on_cancel(move || h.set(h.get() + 100)).is_none());
        assert_eq!(hits.get(), 101);
    }

    #[test]
    fn test_children_follow_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(grandchild.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn test_run_aborts_on_cancel() {
        let token = CancelToken::new();
        let pending = std::future::pending::<()>();
        let mut fut = Box::pin(token.run(pending));
        assert!(fut.as_mut().now_or_never().is_none());

        token.cancel();
        assert_eq!(
            fut.now_or_never(),
            Some(Err(TransportError::Cancelled))
        );

        let token = CancelToken::new();
        assert_eq!(token.run(async { 7 }).now_or_never(), Some(Ok(7)));
    }
}
