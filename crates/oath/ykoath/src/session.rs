//! Per-tag session
//!
//! A [`TagSession`] follows one physical tag through its presence states,
//! remembers what the applet reported on the last SELECT and serializes the
//! operations submitted against the tag. Exactly one operation is active at a
//! time; the others wait in a FIFO.
//!
//! Changes are queued while the session mutates and delivered to listeners
//! afterwards, finished operations first.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use tokio::sync::oneshot;
use tracing::debug;
use ykoath_apdu_core::{
    CancelToken, Command, IsoDepTransport, Response, SendRemainingProcessor,
};

use crate::commands::SelectResponse;
use crate::events::{ListenerId, Listeners};
use crate::operation::{self, Exchange, Kind, OpState, Operation};
use crate::{Algorithm, Error, Result, TagState};

/// What the NFC access layer knows about a present tag
#[derive(Clone)]
pub enum TagLink {
    /// ISO-DEP capable tag
    IsoDep(Rc<dyn IsoDepTransport>),
    /// Anything else
    Other,
}

impl fmt::Debug for TagLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IsoDep(transport) => f.debug_tuple("IsoDep").field(transport).finish(),
            Self::Other => f.write_str("Other"),
        }
    }
}

/// Change notifications of a [`TagSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// An operation left the session
    OperationFinished {
        /// Operation id
        id: u32,
        /// Whether it completed successfully
        success: bool,
    },
    /// Card id changed
    IdChanged,
    /// Firmware version changed
    VersionChanged,
    /// Authentication challenge changed
    ChallengeChanged,
    /// Access key algorithm changed
    AlgorithmChanged,
    /// Session state changed
    StateChanged,
    /// Set of attached operations changed
    OperationIdsChanged,
}

// Emission order of queued changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Signal {
    Id,
    Version,
    Challenge,
    Algorithm,
    State,
    OperationIds,
}

impl From<Signal> for SessionEvent {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Id => Self::IdChanged,
            Signal::Version => Self::VersionChanged,
            Signal::Challenge => Self::ChallengeChanged,
            Signal::Algorithm => Self::AlgorithmChanged,
            Signal::State => Self::StateChanged,
            Signal::OperationIds => Self::OperationIdsChanged,
        }
    }
}

/// Operation ids, unique among the operations attached to a session
#[derive(Debug, Default)]
pub struct OperationIds {
    last: Cell<u32>,
}

impl OperationIds {
    /// Fresh allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Next positive id not in `in_use`
    pub fn allocate(&self, in_use: &[u32]) -> u32 {
        let next = |id: u32| id.wrapping_add(1).max(1);
        let mut id = next(self.last.get());
        while in_use.contains(&id) {
            id = next(id);
        }
        self.last.set(id);
        id
    }
}

#[derive(Debug, Default)]
struct Identity {
    card_id: Vec<u8>,
    version: Vec<u8>,
    challenge: Vec<u8>,
    algorithm: Option<Algorithm>,
}

#[derive(Default)]
struct Inner {
    state: TagState,
    link: Option<Rc<dyn IsoDepTransport>>,
    presence: Option<CancelToken>,
    identity: Identity,
    active: Option<Rc<Operation>>,
    queue: VecDeque<Rc<Operation>>,
    operation_ids: Vec<u32>,
    finished: BTreeMap<u32, bool>,
    signals: BTreeSet<Signal>,
    emitting: bool,
}

impl Inner {
    fn set_state(&mut self, state: TagState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Tag state");
            self.state = state;
            self.signals.insert(Signal::State);
        }
    }

    fn update_identity(&mut self, response: SelectResponse) {
        let identity = &mut self.identity;
        if identity.card_id != response.card_id {
            debug!(card = %hex::encode(&response.card_id), "Card id");
            identity.card_id = response.card_id;
            self.signals.insert(Signal::Id);
        }
        if identity.version != response.version {
            identity.version = response.version;
            self.signals.insert(Signal::Version);
        }
        if identity.challenge != response.challenge {
            identity.challenge = response.challenge;
            self.signals.insert(Signal::Challenge);
        }
        if identity.algorithm != response.algorithm {
            identity.algorithm = response.algorithm;
            self.signals.insert(Signal::Algorithm);
        }
    }

    fn clear_identity(&mut self) {
        self.update_identity(SelectResponse::default());
    }

    fn detach(&mut self, op: &Operation) {
        if let Some((id, success)) = op.detach() {
            self.operation_ids.retain(|other| *other != id);
            self.finished.insert(id, success);
            self.signals.insert(Signal::OperationIds);
        }
    }

    fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some((id, success)) = self.finished.pop_first() {
            return Some(SessionEvent::OperationFinished { id, success });
        }
        self.signals.pop_first().map(SessionEvent::from)
    }

    /// Detach everything, returning the operations to cancel
    fn drop_operations(&mut self) -> Vec<Rc<Operation>> {
        let ops: Vec<_> = self.active.take().into_iter().chain(self.queue.drain(..)).collect();
        for op in &ops {
            self.detach(op);
        }
        ops
    }
}

/// Session of one physical tag
pub struct TagSession {
    path: String,
    ids: Rc<OperationIds>,
    processor: SendRemainingProcessor,
    inner: RefCell<Inner>,
    listeners: Listeners<SessionEvent>,
}

impl fmt::Debug for TagSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TagSession")
            .field("path", &self.path)
            .field("state", &inner.state)
            .field("identity", &inner.identity)
            .field("operation_ids", &inner.operation_ids)
            .finish()
    }
}

impl TagSession {
    /// Session of the tag at `path`, with no tag present yet
    pub fn new(
        path: impl Into<String>,
        ids: Rc<OperationIds>,
        processor: SendRemainingProcessor,
    ) -> Rc<Self> {
        Rc::new(Self {
            path: path.into(),
            ids,
            processor,
            inner: RefCell::new(Inner::default()),
            listeners: Listeners::new(),
        })
    }

    /// Tag path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current state
    pub fn state(&self) -> TagState {
        self.inner.borrow().state
    }

    /// Card id from the last SELECT
    pub fn card_id(&self) -> Vec<u8> {
        self.inner.borrow().identity.card_id.clone()
    }

    /// Raw firmware version from the last SELECT
    pub fn version(&self) -> Vec<u8> {
        self.inner.borrow().identity.version.clone()
    }

    /// Pending authentication challenge
    pub fn challenge(&self) -> Vec<u8> {
        self.inner.borrow().identity.challenge.clone()
    }

    /// Whether the applet wants us to authenticate
    pub fn has_auth_challenge(&self) -> bool {
        !self.inner.borrow().identity.challenge.is_empty()
    }

    /// Access key algorithm reported by the applet
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.inner.borrow().identity.algorithm
    }

    /// Ids of attached operations, ascending
    pub fn operation_ids(&self) -> Vec<u32> {
        self.inner.borrow().operation_ids.clone()
    }

    /// Register a change listener
    pub fn subscribe(&self, callback: impl Fn(&SessionEvent) + 'static) -> ListenerId {
        self.listeners.add(callback)
    }

    /// Remove a change listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    /// Feed tag presence from the NFC access layer
    ///
    /// `None` means the tag is gone. An ISO-DEP tag gets bootstrapped with a
    /// SELECT, anything else is unrecognized.
    pub fn update_tag(self: &Rc<Self>, tag: Option<TagLink>) {
        match tag {
            None => self.set_final_state(TagState::None),
            Some(TagLink::Other) => self.set_final_state(TagState::Unrecognized),
            Some(TagLink::IsoDep(link)) => {
                let presence = {
                    let mut inner = self.inner.borrow_mut();
                    if inner.presence.is_some() {
                        None
                    } else {
                        let presence = CancelToken::new();
                        inner.link = Some(link);
                        inner.presence = Some(presence.clone());
                        inner.set_state(TagState::Checking);
                        Some(presence)
                    }
                };
                match presence {
                    Some(presence) => {
                        let op = Operation::new(Kind::Initialize, true, &presence);
                        self.submit(op, false);
                    }
                    None => self.emit_queued(),
                }
            }
        }
    }

    /// Queue one raw exchange
    ///
    /// The exchange is cancelled together with `parent`.
    pub fn transmit(
        self: &Rc<Self>,
        command: Command,
        requires_select: bool,
        parent: &CancelToken,
    ) -> Transmission {
        let (reply, response) = oneshot::channel();
        let op = Operation::new(Kind::Transmit { command, reply }, requires_select, parent);
        let id = self.submit(op, false);
        Transmission { id, response }
    }

    /// Attach `op` and start it, or queue it behind the active one
    pub(crate) fn submit(self: &Rc<Self>, op: Rc<Operation>, to_front: bool) -> u32 {
        let (id, start) = {
            let mut inner = self.inner.borrow_mut();
            let id = self.ids.allocate(&inner.operation_ids);
            op.attach(self, id);
            let pos = inner.operation_ids.partition_point(|other| *other < id);
            inner.operation_ids.insert(pos, id);
            inner.signals.insert(Signal::OperationIds);
            if inner.active.is_none() {
                op.set_state(OpState::Active);
                inner.active = Some(op.clone());
                (id, true)
            } else {
                op.set_state(OpState::Queued);
                if to_front {
                    inner.queue.push_front(op.clone());
                } else {
                    inner.queue.push_back(op.clone());
                }
                (id, false)
            }
        };
        debug!(op = op.name(), id, to_front, path = %self.path, "Submitted");

        op.watch_cancel();
        if start {
            tokio::task::spawn_local(operation::drive(op));
        }
        self.emit_queued();
        id
    }

    /// [`submit`](Self::submit), dropping a queued duplicate first
    pub(crate) fn submit_unique(self: &Rc<Self>, op: Rc<Operation>, to_front: bool) -> u32 {
        let duplicate = {
            let mut inner = self.inner.borrow_mut();
            let duplicate = inner
                .queue
                .iter()
                .position(|queued| queued.same_request(&op))
                .and_then(|pos| inner.queue.remove(pos));
            if let Some(duplicate) = &duplicate {
                inner.detach(duplicate);
            }
            duplicate
        };
        if let Some(duplicate) = duplicate {
            debug!(op = duplicate.name(), id = duplicate.id(), "Dropping duplicate");
            duplicate.delete();
        }
        self.submit(op, to_front)
    }

    /// Detach `op`, moving on to the next queued operation if it was active
    pub(crate) fn done(self: &Rc<Self>, op: &Rc<Operation>) {
        let next = {
            let mut inner = self.inner.borrow_mut();
            inner.detach(op);
            if inner.active.as_ref().is_some_and(|active| Rc::ptr_eq(active, op)) {
                inner.active = inner.queue.pop_front();
                inner.active.clone()
            } else {
                inner.queue.retain(|queued| !Rc::ptr_eq(queued, op));
                None
            }
        };
        if let Some(next) = next {
            next.set_state(OpState::Active);
            tokio::task::spawn_local(operation::drive(next));
        }
        self.emit_queued();
    }

    pub(crate) fn exchange(self: &Rc<Self>, cancel: CancelToken) -> Option<Exchange> {
        let link = self.inner.borrow().link.clone()?;
        Some(Exchange {
            link,
            cancel,
            processor: self.processor,
            session: Rc::downgrade(self),
            selected: false,
        })
    }

    /// Take over what the applet reported and tell listeners right away
    pub(crate) fn apply_select(&self, response: SelectResponse) {
        self.inner.borrow_mut().update_identity(response);
        self.emit_queued();
    }

    /// Bootstrap completed
    pub(crate) fn ready(&self) {
        self.inner.borrow_mut().set_state(TagState::Ready);
        self.emit_queued();
    }

    /// The tag talks ISO-DEP but has no OATH applet
    pub(crate) fn not_recognized(self: &Rc<Self>) {
        self.set_final_state(TagState::Unrecognized);
    }

    fn set_final_state(self: &Rc<Self>, state: TagState) {
        let (ops, presence) = {
            let mut inner = self.inner.borrow_mut();
            inner.clear_identity();
            let ops = inner.drop_operations();
            inner.link = None;
            inner.set_state(state);
            (ops, inner.presence.take())
        };
        if let Some(presence) = presence {
            presence.cancel();
        }
        for op in ops {
            op.cancel();
            op.delete();
        }
        self.emit_queued();
    }

    fn emit_queued(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.emitting {
                return;
            }
            inner.emitting = true;
        }
        loop {
            let event = self.inner.borrow_mut().next_event();
            match event {
                Some(event) => self.listeners.emit(&event),
                None => break,
            }
        }
        self.inner.borrow_mut().emitting = false;
    }
}

impl Drop for TagSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(presence) = inner.presence.take() {
            presence.cancel();
        }
        for op in inner.drop_operations() {
            op.cancel();
            op.delete();
        }
    }
}

/// Handle of an exchange queued with [`TagSession::transmit`]
#[derive(Debug)]
pub struct Transmission {
    id: u32,
    response: oneshot::Receiver<Result<Response>>,
}

impl Transmission {
    /// Operation id
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the response
    ///
    /// Fails with [`Error::Cancelled`] if the operation never ran.
    pub async fn response(self) -> Result<Response> {
        self.response.await.unwrap_or(Err(Error::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use tokio::task::LocalSet;
    use ykoath_apdu_core::mock::MockTransport;
    use ykoath_apdu_core::TransportError;

    const SELECT_OK: &[u8] = &hex!("7903040201 7103AABBCC 7408 0102030405060708 9000");

    fn session() -> Rc<TagSession> {
        TagSession::new("reader0", Rc::new(OperationIds::new()), SendRemainingProcessor::new())
    }

    fn record(session: &TagSession) -> Rc<RefCell<Vec<SessionEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        session.subscribe(move |event| e.borrow_mut().push(*event));
        events
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn finished(events: &[SessionEvent]) -> Vec<(u32, bool)> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::OperationFinished { id, success } => Some((*id, *success)),
                _ => None,
            })
            .collect()
    }

    fn apdu(ins: u8) -> Command {
        Command::new(0x00, ins, 0x00, 0x00)
    }

    #[test]
    fn test_id_allocation_skips_ids_in_use() {
        let ids = OperationIds::new();
        assert_eq!(ids.allocate(&[]), 1);
        assert_eq!(ids.allocate(&[2, 3]), 4);
        ids.last.set(u32::MAX);
        assert_eq!(ids.allocate(&[1]), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_bootstrap_to_ready() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(MockTransport::new().with_response(SELECT_OK.to_vec()));
                let events = record(&session);

                session.update_tag(Some(TagLink::IsoDep(mock.clone())));
                assert_eq!(session.state(), TagState::Checking);
                assert_eq!(session.operation_ids().len(), 1);
                settle().await;

                assert_eq!(session.state(), TagState::Ready);
                assert_eq!(session.card_id(), hex!("AABBCC"));
                assert_eq!(session.version(), hex!("040201"));
                assert!(session.has_auth_challenge());
                assert_eq!(session.algorithm(), None);
                assert!(session.operation_ids().is_empty());
                assert_eq!(mock.commands(), vec![crate::commands::select().to_bytes()]);

                let events = events.borrow();
                assert_eq!(finished(&events), vec![(1, true)]);
                let pos = |wanted| events.iter().position(|e| *e == wanted).unwrap();
                assert!(pos(SessionEvent::IdChanged) < pos(SessionEvent::StateChanged));
                assert!(pos(SessionEvent::VersionChanged) < pos(SessionEvent::ChallengeChanged));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_select_conflict_retried_once() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(
                    MockTransport::new()
                        .with_response(hex!("6883").to_vec())
                        .with_response(SELECT_OK.to_vec()),
                );
                session.update_tag(Some(TagLink::IsoDep(mock.clone())));
                settle().await;
                assert_eq!(session.state(), TagState::Ready);
                assert_eq!(mock.commands().len(), 2);

                // Two conflicts in a row fail the bootstrap
                let session = self::session();
                let mock = Rc::new(
                    MockTransport::new()
                        .with_response(hex!("6883").to_vec())
                        .with_response(hex!("6883").to_vec())
                        .with_response(SELECT_OK.to_vec()),
                );
                session.update_tag(Some(TagLink::IsoDep(mock.clone())));
                settle().await;
                assert_eq!(session.state(), TagState::Unrecognized);
                assert_eq!(mock.commands().len(), 2);
                assert_eq!(mock.pending_responses(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_queue_order() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(
                    MockTransport::new()
                        .with_response(SELECT_OK.to_vec())
                        .with_success(&hex!("0A"))
                        .with_success(&hex!("0B"))
                        .with_success(&hex!("0C")),
                );
                // Keep the tag locked so that no operation reselects
                let cancel = CancelToken::new();
                let _lock = mock.acquire_lock(&cancel).await.unwrap();
                let events = record(&session);

                session.update_tag(Some(TagLink::IsoDep(mock.clone())));
                let a = session.transmit(apdu(0xA0), false, &cancel);
                let b = session.transmit(apdu(0xB0), false, &cancel);
                let c = session.transmit(apdu(0xC0), false, &cancel);
                assert_eq!(session.operation_ids(), vec![1, 2, 3, 4]);
                assert_eq!((a.id(), b.id(), c.id()), (2, 3, 4));

                assert_eq!(a.response().await.unwrap().payload().as_ref(), hex!("0A"));
                assert_eq!(b.response().await.unwrap().payload().as_ref(), hex!("0B"));
                assert_eq!(c.response().await.unwrap().payload().as_ref(), hex!("0C"));
                settle().await;

                let sent: Vec<u8> = mock.commands().iter().map(|c| c[1]).collect();
                assert_eq!(sent, vec![0xA4, 0xA0, 0xB0, 0xC0]);
                assert_eq!(
                    finished(&events.borrow()),
                    vec![(1, true), (2, true), (3, true), (4, true)]
                );
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_to_front_and_unique() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(
                    MockTransport::new()
                        .with_response(SELECT_OK.to_vec())
                        .with_success(&hex!("0C"))
                        .with_success(&hex!("0B")),
                );
                let cancel = CancelToken::new();
                let _lock = mock.acquire_lock(&cancel).await.unwrap();
                session.update_tag(Some(TagLink::IsoDep(mock.clone())));

                let a = session.transmit(apdu(0xA0), false, &cancel);
                let b = session.transmit(apdu(0xB0), false, &cancel);
                assert_eq!(session.inner.borrow().queue.len(), 2);
                let superseded = session.inner.borrow().queue[0].clone();

                // Same request again: the first queued one goes away
                let (reply, _reply) = oneshot::channel();
                let op = Operation::new(
                    Kind::Transmit { command: apdu(0xC0), reply },
                    false,
                    &cancel,
                );
                let c = session.submit_unique(op, true);
                {
                    let inner = session.inner.borrow();
                    let queued: Vec<_> = inner.queue.iter().map(|op| op.id()).collect();
                    assert_eq!(queued, vec![c, b.id()]);
                    assert_eq!(inner.queue[0].state(), OpState::Queued);
                }
                assert!(!session.operation_ids().contains(&a.id()));
                assert_eq!(superseded.state(), OpState::Deleted);
                assert!(matches!(a.response().await, Err(Error::Cancelled)));
                assert!(b.response().await.unwrap().is_success());

                let sent: Vec<u8> = mock.commands().iter().map(|c| c[1]).collect();
                assert_eq!(sent, vec![0xA4, 0xC0, 0xB0]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_queued_never_transmits() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(
                    MockTransport::new()
                        .with_response(SELECT_OK.to_vec())
                        .with_success(&hex!("0B")),
                );
                let cancel = CancelToken::new();
                let _lock = mock.acquire_lock(&cancel).await.unwrap();
                let events = record(&session);
                session.update_tag(Some(TagLink::IsoDep(mock.clone())));

                let doomed = CancelToken::new();
                let a = session.transmit(apdu(0xA0), false, &doomed);
                let b = session.transmit(apdu(0xB0), false, &cancel);
                let cancelled = session.inner.borrow().queue[0].clone();
                doomed.cancel();
                assert_eq!(session.operation_ids(), vec![1, 3]);
                assert_eq!(cancelled.state(), OpState::Cancelled);
                assert_eq!(finished(&events.borrow()), vec![(2, false)]);

                assert!(matches!(a.response().await, Err(Error::Cancelled)));
                assert!(b.response().await.unwrap().is_success());
                let sent: Vec<u8> = mock.commands().iter().map(|c| c[1]).collect();
                assert_eq!(sent, vec![0xA4, 0xB0]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_tag_gone_cancels_everything() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(MockTransport::new().with_response(SELECT_OK.to_vec()));
                let cancel = CancelToken::new();
                session.update_tag(Some(TagLink::IsoDep(mock.clone())));
                settle().await;

                let a = session.transmit(apdu(0xA0), false, &cancel);
                let b = session.transmit(apdu(0xB0), false, &cancel);
                let ops: Vec<_> = {
                    let inner = session.inner.borrow();
                    inner.active.iter().chain(inner.queue.iter()).cloned().collect()
                };
                assert_eq!(ops.len(), 2);
                session.update_tag(None);

                assert!(ops.iter().all(|op| op.state() == OpState::Deleted));
                assert_eq!(session.state(), TagState::None);
                assert!(session.card_id().is_empty());
                assert!(session.operation_ids().is_empty());
                assert!(matches!(a.response().await, Err(Error::Cancelled)));
                assert!(matches!(b.response().await, Err(Error::Cancelled)));
                assert!(!cancel.is_cancelled());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_lock_handed_over_then_released() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(
                    MockTransport::new()
                        .with_response(SELECT_OK.to_vec())
                        .with_success(&hex!("0A")),
                );
                let cancel = CancelToken::new();
                session.update_tag(Some(TagLink::IsoDep(mock.clone())));
                let a = session.transmit(apdu(0xA0), false, &cancel);

                a.response().await.unwrap();
                assert_eq!(mock.lock_acquisitions(), 1);
                settle().await;
                assert!(!mock.is_locked());

                let sent: Vec<u8> = mock.commands().iter().map(|c| c[1]).collect();
                assert_eq!(sent, vec![0xA4, 0xA0]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_lock_failure_fails_operation() {
        LocalSet::new()
            .run_until(async {
                let session = session();
                let mock = Rc::new(MockTransport::new());
                mock.fail_lock(TransportError::Lock("busy".into()));
                let events = record(&session);
                session.update_tag(Some(TagLink::IsoDep(mock.clone())));
                settle().await;

                assert_eq!(session.state(), TagState::Checking);
                assert_eq!(finished(&events.borrow()), vec![(1, false)]);
                assert!(mock.commands().is_empty());
            })
            .await;
    }

    #[test]
    fn test_other_tag_unrecognized() {
        let session = session();
        session.update_tag(Some(TagLink::Other));
        assert_eq!(session.state(), TagState::Unrecognized);
        session.update_tag(None);
        assert_eq!(session.state(), TagState::None);
    }
}
