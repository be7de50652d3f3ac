//! Operations queued on a tag session
//!
//! An [`Operation`] is one logical job against a tag. Its lifecycle only ever
//! moves forward through [`OpState`]. Once started, an operation is driven by
//! one local task that takes (or reuses) the tag lock, selects the applet when
//! needed and then runs the job body.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use ykoath_apdu_core::cancel::CallbackId;
use ykoath_apdu_core::{
    CancelToken, Command, IsoDepTransport, Response, SendRemainingProcessor, TagLock,
};

use crate::commands::{self, SelectResponse};
use crate::session::TagSession;
use crate::yubikey::KeyJob;
use crate::{Error, Result};

/// Lifecycle of an operation
///
/// States are ordered and never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpState {
    /// Created, not submitted
    Init,
    /// Waiting for the active operation to finish
    Queued,
    /// Owns the session
    Active,
    /// Completed, successfully or not
    Finished,
    /// Aborted through its cancel token
    Cancelled,
    /// Torn down with its session, or replaced in the queue by a newer copy
    /// of the same request
    Deleted,
}

/// What an operation does once it owns the tag
pub(crate) enum Kind {
    /// Bootstrap of a freshly present tag
    Initialize,
    /// A single exchange on behalf of a caller
    Transmit {
        command: Command,
        reply: oneshot::Sender<Result<Response>>,
    },
    /// YubiKey command
    Key(KeyJob),
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::Transmit { .. } => "Transmit",
            Self::Key(job) => job.name(),
        }
    }
}

/// How a started operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Finished(bool),
    Cancelled,
}

impl From<Result<bool>> for Outcome {
    fn from(result: Result<bool>) -> Self {
        match result {
            Ok(success) => Self::Finished(success),
            Err(e) if e.is_cancelled() => Self::Cancelled,
            Err(_) => Self::Finished(false),
        }
    }
}

/// One job queued on a [`TagSession`]
pub(crate) struct Operation {
    name: &'static str,
    requires_select: bool,
    cancel: CancelToken,
    state: Cell<OpState>,
    id: Cell<u32>,
    success: Cell<bool>,
    session: RefCell<Weak<TagSession>>,
    kind: RefCell<Option<Kind>>,
    cancel_hook: Cell<Option<CallbackId>>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("id", &self.id.get())
            .field("state", &self.state.get())
            .field("requires_select", &self.requires_select)
            .finish()
    }
}

impl Operation {
    /// New operation cancelled together with `parent`
    pub(crate) fn new(kind: Kind, requires_select: bool, parent: &CancelToken) -> Rc<Self> {
        Rc::new(Self {
            name: kind.name(),
            requires_select,
            cancel: parent.child(),
            state: Cell::new(OpState::Init),
            id: Cell::new(0),
            success: Cell::new(false),
            session: RefCell::new(Weak::new()),
            kind: RefCell::new(Some(kind)),
            cancel_hook: Cell::new(None),
        })
    }

    pub(crate) const fn name(&self) -> &'static str {
        self.name
    }

    /// Id assigned on submission, 0 before
    pub(crate) fn id(&self) -> u32 {
        self.id.get()
    }

    pub(crate) fn state(&self) -> OpState {
        self.state.get()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether `other` stands for the same logical request
    pub(crate) fn same_request(&self, other: &Self) -> bool {
        self.name == other.name && self.requires_select == other.requires_select
    }

    /// Move forward to `state`, returns false if already there or past it
    pub(crate) fn set_state(&self, state: OpState) -> bool {
        if state > self.state.get() {
            self.state.set(state);
            true
        } else {
            false
        }
    }

    pub(crate) fn attach(&self, session: &Rc<TagSession>, id: u32) {
        self.id.set(id);
        *self.session.borrow_mut() = Rc::downgrade(session);
    }

    /// Forget the session, returns the finished pair if it was attached
    pub(crate) fn detach(&self) -> Option<(u32, bool)> {
        let session = std::mem::take(&mut *self.session.borrow_mut());
        (session.strong_count() > 0).then(|| (self.id.get(), self.success.get()))
    }

    pub(crate) fn session(&self) -> Option<Rc<TagSession>> {
        self.session.borrow().upgrade()
    }

    /// Run the cancel hook when the token fires
    pub(crate) fn watch_cancel(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let hook = self.cancel.on_cancel(move || {
            if let Some(op) = weak.upgrade() {
                op.on_cancelled();
            }
        });
        self.cancel_hook.set(hook);
    }

    fn forget_cancel_hook(&self) {
        if let Some(hook) = self.cancel_hook.take() {
            self.cancel.remove_callback(hook);
        }
    }

    fn on_cancelled(self: &Rc<Self>) {
        let previous = self.state.get();
        if !self.set_state(OpState::Cancelled) {
            return;
        }
        debug!(op = self.name, id = self.id(), "Cancelled");
        // An active operation is completed by its task once the exchange in
        // flight returns
        if previous == OpState::Queued {
            if let Some(session) = self.session() {
                session.done(self);
            }
        }
    }

    /// Final state once the session lets go of the operation for good
    pub(crate) fn delete(&self) {
        self.forget_cancel_hook();
        self.set_state(OpState::Deleted);
        self.kind.borrow_mut().take();
        trace!(op = self.name, id = self.id(), "Deleted");
    }

    fn complete(self: &Rc<Self>, outcome: Outcome) {
        self.forget_cancel_hook();
        match outcome {
            Outcome::Finished(success) => {
                if self.set_state(OpState::Finished) {
                    self.success.set(success);
                    debug!(op = self.name, id = self.id(), success, "Finished");
                }
            }
            Outcome::Cancelled => {
                if self.set_state(OpState::Cancelled) {
                    debug!(op = self.name, id = self.id(), "Cancelled");
                }
            }
        }
        if let Some(session) = self.session() {
            session.done(self);
        }
    }

    async fn run(self: &Rc<Self>, held: &mut Option<TagLock>) -> Outcome {
        let Some(session) = self.session() else {
            return Outcome::Cancelled;
        };
        let Some(mut exchange) = session.exchange(self.cancel.clone()) else {
            debug!(op = self.name, id = self.id(), "No tag to talk to");
            return Outcome::Finished(false);
        };
        drop(session);
        if exchange.is_cancelled() {
            return Outcome::Cancelled;
        }

        let fresh = match exchange.link.lock() {
            Some(lock) => {
                *held = Some(lock);
                false
            }
            None => match exchange.link.acquire_lock(&exchange.cancel).await {
                Ok(lock) => {
                    *held = Some(lock);
                    true
                }
                Err(e) if e.is_cancelled() => return Outcome::Cancelled,
                Err(e) => {
                    warn!(op = self.name, id = self.id(), "Failed to lock the tag: {}", e);
                    return Outcome::Finished(false);
                }
            },
        };

        // Someone else may have selected another applet while the tag was
        // not ours
        if self.requires_select || fresh {
            match select(&exchange).await {
                Ok(response) => {
                    let Some(session) = self.session() else {
                        return Outcome::Cancelled;
                    };
                    session.apply_select(response);
                    exchange.selected = true;
                }
                Err(e) if e.is_cancelled() => return Outcome::Cancelled,
                Err(e) => {
                    warn!(op = self.name, id = self.id(), "SELECT failed: {}", e);
                    if matches!(e, Error::Status(_)) && self.name == "Initialize" {
                        if let Some(session) = self.session() {
                            session.not_recognized();
                        }
                    }
                    return Outcome::Finished(false);
                }
            }
            // Listeners of the new identity may have cancelled us
            if exchange.is_cancelled() {
                return Outcome::Cancelled;
            }
        }

        let kind = self.kind.borrow_mut().take();
        match kind {
            None => Outcome::Finished(false),
            Some(Kind::Initialize) => match self.session() {
                Some(session) => {
                    session.ready();
                    Outcome::Finished(true)
                }
                None => Outcome::Cancelled,
            },
            Some(Kind::Transmit { command, reply }) => {
                let result = exchange.send(&command).await;
                let outcome = match &result {
                    Ok(response) => Outcome::Finished(response.is_success()),
                    Err(e) if e.is_cancelled() => Outcome::Cancelled,
                    Err(_) => Outcome::Finished(false),
                };
                // The caller may have stopped waiting
                let _ = reply.send(result);
                outcome
            }
            Some(Kind::Key(job)) => {
                let result = job.run(&exchange).await;
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        warn!(op = self.name, id = self.id(), "{}", e);
                    }
                }
                result.into()
            }
        }
    }
}

/// Drive a started operation to its end and hand the tag over
pub(crate) async fn drive(op: Rc<Operation>) {
    trace!(op = op.name(), id = op.id(), "Starting");
    let mut held = None;
    let outcome = op.run(&mut held).await;
    op.complete(outcome);

    // The next operation, if any, has already been spawned and picks the
    // lock up before this task lets go of it
    if let Some(lock) = held {
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            drop(lock);
        });
    }
}

/// Link of a running operation to its tag
pub(crate) struct Exchange {
    pub(crate) link: Rc<dyn IsoDepTransport>,
    pub(crate) cancel: CancelToken,
    pub(crate) processor: SendRemainingProcessor,
    pub(crate) session: Weak<TagSession>,
    /// The applet was selected for this operation
    pub(crate) selected: bool,
}

impl Exchange {
    /// One chained exchange, whatever the final status
    pub(crate) async fn send(&self, command: &Command) -> Result<Response> {
        Ok(self
            .processor
            .exchange(&*self.link, command, &self.cancel)
            .await?)
    }

    /// One chained exchange that must end with `90 00`
    pub(crate) async fn send_ok(&self, command: &Command) -> Result<Bytes> {
        let response = self.send(command).await?;
        if response.is_success() {
            Ok(response.into_payload())
        } else {
            Err(Error::Status(response.status()))
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The session, unless it is gone
    pub(crate) fn session(&self) -> Result<Rc<TagSession>> {
        self.session.upgrade().ok_or(Error::Cancelled)
    }
}

/// SELECT the applet, retrying once on a selection conflict
async fn select(exchange: &Exchange) -> Result<SelectResponse> {
    let command = commands::select();
    let mut response = exchange.send(&command).await?;
    if response.status().is_select_conflict() {
        debug!("SELECT conflict, retrying");
        response = exchange.send(&command).await?;
    }
    if !response.is_success() {
        return Err(Error::Status(response.status()));
    }
    Ok(SelectResponse::parse(response.payload()))
}
