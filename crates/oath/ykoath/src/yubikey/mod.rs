//! Per-card core
//!
//! A [`YubiKey`] stands for one logical card, identified by the id its applet
//! reports. It follows the session of the active tag path and turns session
//! changes into card properties: presence, authorization, the raw credential
//! list and codes, and the TOTP validity timer.
//!
//! Property changes are queued and emitted in a fixed order once the card is
//! done updating itself.

mod ops;

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use ykoath_apdu_core::CancelToken;

use crate::commands;
use crate::context::Shared;
use crate::crypto::{compute_response, derive_key, random_challenge};
use crate::events::{ListenerId, Listeners};
use crate::keystore::KeyChanged;
use crate::operation::{Kind, Operation};
use crate::session::{SessionEvent, TagSession};
use crate::{
    Algorithm, AuthAccess, Error, OtpEntry, Result, TagState, Token, Version, card_name,
};

pub(crate) use ops::KeyJob;
use ops::KeyOp;

/// Notifications of a [`YubiKey`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YubiKeyEvent {
    /// Firmware version changed
    VersionChanged,
    /// The credential list has been read
    OtpListFetchedChanged,
    /// Raw credential list changed
    OtpListChanged,
    /// Raw codes changed
    OtpDataChanged,
    /// Card came or went
    PresentChanged,
    /// Authorization changed
    AuthAccessChanged,
    /// Set of refreshable credentials changed
    RefreshableTokensChanged,
    /// Set of in-flight operations changed
    OperationIdsChanged,
    /// Seconds left in the TOTP period changed
    TotpTimeLeftChanged,
    /// TOTP codes became valid or expired
    TotpValidChanged,
    /// The card rejected our access key
    AccessKeyNotAccepted,
    /// An operation submitted on the card's tag left the session
    OperationFinished {
        /// Operation id
        id: u32,
        /// Whether it completed successfully
        success: bool,
    },
    /// The TOTP period rolled over
    TotpCodesExpired,
    /// A new access code was set
    PasswordChanged,
    /// The access code was removed
    PasswordRemoved,
    /// The applet was factory reset
    YubiKeyReset,
}

// Emission order of queued changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Signal {
    Version,
    OtpListFetched,
    OtpList,
    OtpData,
    Present,
    AuthAccess,
    RefreshableTokens,
    OperationIds,
    TotpTimeLeft,
    TotpValid,
    AccessKeyNotAccepted,
}

impl From<Signal> for YubiKeyEvent {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Version => Self::VersionChanged,
            Signal::OtpListFetched => Self::OtpListFetchedChanged,
            Signal::OtpList => Self::OtpListChanged,
            Signal::OtpData => Self::OtpDataChanged,
            Signal::Present => Self::PresentChanged,
            Signal::AuthAccess => Self::AuthAccessChanged,
            Signal::RefreshableTokens => Self::RefreshableTokensChanged,
            Signal::OperationIds => Self::OperationIdsChanged,
            Signal::TotpTimeLeft => Self::TotpTimeLeftChanged,
            Signal::TotpValid => Self::TotpValidChanged,
            Signal::AccessKeyNotAccepted => Self::AccessKeyNotAccepted,
        }
    }
}

struct Binding {
    session: Rc<TagSession>,
    listener: ListenerId,
    // Parent of every operation submitted while bound
    cancel: CancelToken,
}

#[derive(Default)]
struct State {
    binding: Option<Binding>,
    present: bool,
    auth_access: AuthAccess,
    auth_algorithm: Option<Algorithm>,
    version: Option<Version>,
    otp_list: Vec<u8>,
    otp_data: Vec<u8>,
    otp_list_fetched: bool,
    refreshable: Vec<String>,
    operation_ids: Vec<u32>,
    last_requested_period: u64,
    last_received_period: Option<u64>,
    totp_valid: bool,
    totp_time_left: u32,
    timer: Option<JoinHandle<()>>,
    ignore_key_changes: bool,
    signals: BTreeSet<Signal>,
    emitting: bool,
}

impl State {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// One logical card
pub struct YubiKey {
    id: Vec<u8>,
    this: Weak<Self>,
    context: Rc<Shared>,
    state: RefCell<State>,
    listeners: Listeners<YubiKeyEvent>,
    key_listener: Cell<Option<ListenerId>>,
}

impl fmt::Debug for YubiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("YubiKey")
            .field("id", &self.id_hex())
            .field("present", &state.present)
            .field("auth_access", &state.auth_access)
            .field("operation_ids", &state.operation_ids)
            .finish_non_exhaustive()
    }
}

impl YubiKey {
    pub(crate) fn new(id: Vec<u8>, context: Rc<Shared>) -> Rc<Self> {
        let key = Rc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            context,
            state: RefCell::new(State::default()),
            listeners: Listeners::new(),
            key_listener: Cell::new(None),
        });
        let weak = Rc::downgrade(&key);
        let listener = key.context.keystore.subscribe(move |change| {
            if let Some(key) = weak.upgrade() {
                key.on_access_key_changed(change);
            }
        });
        key.key_listener.set(Some(listener));
        debug!(card = %key.id_hex(), "Created");
        key.update_path();
        key
    }

    /// Card id
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Card id, hex encoded
    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    /// Whether the card is on the active tag and its applet is selected
    pub fn present(&self) -> bool {
        self.state.borrow().present
    }

    /// Result of the last authorization
    pub fn auth_access(&self) -> AuthAccess {
        self.state.borrow().auth_access
    }

    /// Access key algorithm reported by the card
    pub fn auth_algorithm(&self) -> Option<Algorithm> {
        self.state.borrow().auth_algorithm
    }

    /// Firmware version
    pub fn version(&self) -> Option<Version> {
        self.state.borrow().version
    }

    /// Raw LIST payload
    pub fn otp_list(&self) -> Vec<u8> {
        self.state.borrow().otp_list.clone()
    }

    /// Raw CALCULATE ALL payload, with refreshed codes merged in
    pub fn otp_data(&self) -> Vec<u8> {
        self.state.borrow().otp_data.clone()
    }

    /// Whether the credential list has been read at least once
    pub fn otp_list_fetched(&self) -> bool {
        self.state.borrow().otp_list_fetched
    }

    /// Credentials joined with their codes
    pub fn entries(&self) -> Vec<OtpEntry> {
        let state = self.state.borrow();
        OtpEntry::collect(&state.otp_list, &state.otp_data)
    }

    /// Names of credentials whose codes need an explicit refresh
    pub fn refreshable_tokens(&self) -> Vec<String> {
        self.state.borrow().refreshable.clone()
    }

    /// Ids of the operations in flight on the card's tag
    pub fn operation_ids(&self) -> Vec<u32> {
        self.state.borrow().operation_ids.clone()
    }

    /// Whether the codes belong to the current TOTP period
    pub fn totp_valid(&self) -> bool {
        self.state.borrow().totp_valid
    }

    /// Seconds until the codes expire
    pub fn totp_time_left(&self) -> u32 {
        self.state.borrow().totp_time_left
    }

    /// Register a listener
    pub fn subscribe(&self, callback: impl Fn(&YubiKeyEvent) + 'static) -> ListenerId {
        self.listeners.add(callback)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    /// Store a credential, then reread the list
    pub fn put_token(&self, token: &Token) -> Result<u32> {
        token.validate()?;
        self.present_session().ok_or(Error::NotPresent)?;
        let id = self.submit(KeyOp::Put(token.clone()), false, false);
        self.emit_queued();
        id.ok_or(Error::NotSubmitted)
    }

    /// Store several credentials, returns the id of the last operation
    pub fn put_tokens(&self, tokens: &[Token]) -> Result<u32> {
        tokens.iter().try_for_each(Token::validate)?;
        self.present_session().ok_or(Error::NotPresent)?;
        let mut last = None;
        for token in tokens {
            last = self.submit(KeyOp::Put(token.clone()), false, false).or(last);
        }
        self.emit_queued();
        last.ok_or(Error::NotSubmitted)
    }

    /// Recalculate the codes of `names` one by one
    pub fn refresh_tokens(&self, names: &[String]) -> Option<u32> {
        if names.is_empty() || !self.can_transmit() {
            return None;
        }
        debug!(?names, "Refresh");
        let id = self.submit(KeyOp::Refresh(name_bytes(names)), false, false);
        self.emit_queued();
        id
    }

    /// Delete credentials, then reread the list
    pub fn delete_tokens(&self, names: &[String]) -> Option<u32> {
        if names.is_empty() || !self.can_transmit() {
            return None;
        }
        debug!(?names, "Delete");
        let id = self.submit(KeyOp::Delete(name_bytes(names)), false, false);
        self.emit_queued();
        id
    }

    /// Remember the key for `password` and authorize again
    ///
    /// Needs the card's access key algorithm, known once the card has been
    /// present.
    pub fn submit_password(&self, password: &str, persist: bool) -> Result<()> {
        let algorithm = self.auth_algorithm().ok_or(Error::UnknownAlgorithm)?;

        // Our own change notification would trigger a second check
        self.state.borrow_mut().ignore_key_changes = true;
        let result = self
            .context
            .keystore
            .set_password(&self.id, algorithm, password, persist);
        self.state.borrow_mut().ignore_key_changes = false;

        if matches!(result, Ok(true)) {
            self.update_auth_access(AuthAccess::Unknown);
        }
        // Even if nothing changed
        self.recheck_authorization();
        self.emit_queued();
        result.map(|_| ())
    }

    /// Set a new access code, or remove it if `password` is empty
    pub fn set_password(&self, password: &str) -> Result<u32> {
        let session = self.present_session().ok_or(Error::NotPresent)?;
        let op = if password.is_empty() {
            KeyOp::RemoveCode
        } else {
            let algorithm = session.algorithm().unwrap_or_default();
            let key = derive_key(&self.id, algorithm, password);
            let challenge = random_challenge();
            let response = compute_response(&key, algorithm, &challenge)?;
            KeyOp::SetCode(commands::set_code(algorithm, &key, &challenge, &response))
        };
        let id = self.submit(op, false, false);
        self.emit_queued();
        id.ok_or(Error::NotSubmitted)
    }

    /// Factory reset the applet
    pub fn reset(&self) -> Result<u32> {
        self.present_session().ok_or(Error::NotPresent)?;
        let id = self.submit(KeyOp::Reset, false, false);
        self.emit_queued();
        id.ok_or(Error::NotSubmitted)
    }

    /// Follow the session of the active tag path
    pub(crate) fn update_path(&self) {
        let active = self.context.active_session();
        let current = self.session();
        match (active, current) {
            (Some(active), Some(current)) if Rc::ptr_eq(&active, &current) => {}
            (Some(active), _) => {
                self.drop_tag();
                self.bind(active);
                self.update_tag_state();
            }
            (None, Some(_)) => {
                self.drop_tag();
                self.update_tag_state();
            }
            (None, None) => {}
        }
        self.emit_queued();
    }

    fn bind(&self, session: Rc<TagSession>) {
        debug!(card = %self.id_hex(), path = session.path(), "Bound");
        let weak = self.this.clone();
        let listener = session.subscribe(move |event| {
            if let Some(key) = weak.upgrade() {
                key.on_session_event(*event);
            }
        });
        self.state.borrow_mut().binding = Some(Binding {
            session,
            listener,
            cancel: CancelToken::new(),
        });
    }

    fn drop_tag(&self) {
        let binding = self.state.borrow_mut().binding.take();
        if let Some(binding) = binding {
            // Listeners still hear about the operations going away
            binding.cancel.cancel();
            binding.session.unsubscribe(binding.listener);
        }
    }

    fn session(&self) -> Option<Rc<TagSession>> {
        self.state
            .borrow()
            .binding
            .as_ref()
            .map(|binding| binding.session.clone())
    }

    /// The bound session, if it last selected this card
    fn valid_session(&self) -> Option<Rc<TagSession>> {
        self.session().filter(|session| session.card_id() == self.id)
    }

    fn present_session(&self) -> Option<Rc<TagSession>> {
        if self.present() { self.session() } else { None }
    }

    fn can_transmit(&self) -> bool {
        self.session().is_some_and(|session| session.state() == TagState::Ready)
    }

    fn have_access(&self) -> bool {
        self.auth_access().has_access()
    }

    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::OperationFinished { id, success } => {
                self.listeners.emit(&YubiKeyEvent::OperationFinished { id, success });
            }
            SessionEvent::StateChanged => self.update_tag_state(),
            SessionEvent::IdChanged => self.on_id_changed(),
            SessionEvent::VersionChanged => self.update_version(),
            SessionEvent::AlgorithmChanged => self.update_auth_algorithm(),
            SessionEvent::ChallengeChanged => self.verify_authorization(),
            SessionEvent::OperationIdsChanged => self.update_operation_ids(),
        }
        self.emit_queued();
    }

    fn on_id_changed(&self) {
        let Some(session) = self.session() else {
            return;
        };
        if session.state() == TagState::Ready && session.card_id() != self.id {
            debug!(
                card = %self.id_hex(),
                now = %hex::encode(session.card_id()),
                "Card id changed (reset?)"
            );
            self.drop_tag();
            self.update_tag_state();
        }
    }

    fn on_access_key_changed(&self, change: &KeyChanged) {
        if change.card_id != self.id || self.state.borrow().ignore_key_changes {
            return;
        }
        debug!(card = %self.id_hex(), algorithm = %change.algorithm, "Access key changed");
        self.update_auth_access(AuthAccess::Unknown);
        self.verify_authorization();
        self.emit_queued();
    }

    fn update_tag_state(&self) {
        let present = self.can_transmit() && self.valid_session().is_some();
        {
            let mut state = self.state.borrow_mut();
            if state.present != present {
                debug!(card = %self.id_hex(), present, "Presence");
                state.present = present;
                state.signals.insert(Signal::Present);
            }
        }
        self.update_operation_ids();
        if present {
            self.update_auth_algorithm();
            self.update_version();
            self.verify_authorization();
        }
    }

    fn update_operation_ids(&self) {
        let ids = self
            .valid_session()
            .map(|session| session.operation_ids())
            .unwrap_or_default();
        let mut state = self.state.borrow_mut();
        if state.operation_ids != ids {
            trace!(?ids, "Operation ids");
            state.operation_ids = ids;
            state.signals.insert(Signal::OperationIds);
        }
    }

    fn update_auth_algorithm(&self) {
        let Some(session) = self.valid_session() else {
            return;
        };
        let algorithm = session.algorithm();
        {
            let mut state = self.state.borrow_mut();
            if state.auth_algorithm != algorithm {
                debug!(from = ?state.auth_algorithm, to = ?algorithm, "Access key algorithm");
                state.auth_algorithm = algorithm;
            }
        }
        self.verify_authorization();
    }

    fn update_version(&self) {
        let Some(session) = self.valid_session() else {
            return;
        };
        let version = Version::from_bytes(&session.version());
        let mut state = self.state.borrow_mut();
        if state.version != version {
            state.version = version;
            state.signals.insert(Signal::Version);
        }
    }

    fn verify_authorization(&self) {
        let Some(session) = self.present_session() else {
            return;
        };
        if session.has_auth_challenge() {
            self.submit_unique(KeyOp::Authorize, false, true);
        } else {
            self.authorized(AuthAccess::Open);
        }
    }

    fn recheck_authorization(&self) {
        if self.present() {
            self.submit_unique(KeyOp::Authorize, true, true);
        }
    }

    fn authorized(&self, access: AuthAccess) {
        self.update_auth_access(access);
        self.request_list(false);
    }

    fn request_list(&self, to_front: bool) {
        self.submit_unique(KeyOp::List, false, to_front);
    }

    fn update_auth_access(&self, access: AuthAccess) {
        {
            let mut state = self.state.borrow_mut();
            if state.auth_access == access {
                return;
            }
            debug!(card = %self.id_hex(), from = %state.auth_access, to = %access, "Access");
            state.auth_access = access;
            state.signals.insert(Signal::AuthAccess);
        }
        if !access.has_access() {
            self.update_otp_list(Vec::new());
            self.update_otp_data(Vec::new());
            let mut state = self.state.borrow_mut();
            state.stop_timer();
            if state.totp_valid {
                state.totp_valid = false;
                state.signals.insert(Signal::TotpValid);
            }
            if state.totp_time_left != 0 {
                state.totp_time_left = 0;
                state.signals.insert(Signal::TotpTimeLeft);
            }
        }
    }

    fn update_otp_list(&self, otp_list: Vec<u8>) {
        {
            let mut state = self.state.borrow_mut();
            if state.otp_list == otp_list {
                return;
            }
            trace!(list = %hex::encode(&otp_list), "OTP list");
            state.otp_list = otp_list;
            state.signals.insert(Signal::OtpList);
        }
        self.update_refreshable();
    }

    fn update_otp_data(&self, otp_data: Vec<u8>) {
        {
            let mut state = self.state.borrow_mut();
            if state.otp_data == otp_data {
                return;
            }
            trace!(data = %hex::encode(&otp_data), "OTP data");
            state.otp_data = otp_data;
            state.signals.insert(Signal::OtpData);
        }
        self.update_refreshable();
    }

    fn set_otp_list_fetched(&self) {
        let mut state = self.state.borrow_mut();
        if !state.otp_list_fetched {
            state.otp_list_fetched = true;
            state.signals.insert(Signal::OtpListFetched);
        }
    }

    fn update_refreshable(&self) {
        let refreshable: Vec<String> = self
            .entries()
            .into_iter()
            .filter(OtpEntry::is_refreshable)
            .map(|entry| entry.name)
            .collect();
        let mut state = self.state.borrow_mut();
        if state.refreshable != refreshable {
            state.refreshable = refreshable;
            state.signals.insert(Signal::RefreshableTokens);
        }
    }

    /// Replace the code following `name` with a freshly calculated one
    fn merge_otp_code(&self, name: &[u8], response: &[u8]) {
        let merged = commands::merge_code(&self.state.borrow().otp_data, name, response);
        match merged {
            Some(otp_data) => self.update_otp_data(otp_data),
            None => warn!(name = %String::from_utf8_lossy(name), "OTP block not found"),
        }
    }

    fn period_secs(&self) -> u64 {
        self.context.config.totp_period.as_secs().max(1)
    }

    fn current_period(&self) -> u64 {
        unix_now().as_secs() / self.period_secs()
    }

    fn calculate_all_ok(&self, otp_data: Vec<u8>) {
        {
            let mut state = self.state.borrow_mut();
            state.last_received_period = Some(state.last_requested_period);
        }
        self.update_otp_data(otp_data);
        self.update_totp_timer();
    }

    fn update_totp_timer(&self) {
        let period = self.period_secs();
        let now = unix_now();
        let secs = now.as_secs();
        let this_period = secs / period;

        let expired = {
            let mut state = self.state.borrow_mut();
            let last_time_left = state.totp_time_left;
            let expired = if state.last_received_period == Some(this_period) {
                let time_left = (this_period + 1) * period - secs;
                state.totp_time_left = u32::try_from(time_left).unwrap_or(u32::MAX);
                // Tick on the next second boundary
                let delay = Duration::from_secs(secs + 1).saturating_sub(now);
                state.stop_timer();
                state.timer = Some(self.start_timer(delay));
                if !state.totp_valid {
                    state.totp_valid = true;
                    state.signals.insert(Signal::TotpValid);
                }
                false
            } else {
                state.totp_time_left = 0;
                state.stop_timer();
                let expired = state.totp_valid;
                if expired {
                    state.totp_valid = false;
                    state.signals.insert(Signal::TotpValid);
                }
                expired
            };
            if last_time_left != state.totp_time_left {
                state.signals.insert(Signal::TotpTimeLeft);
            }
            expired
        };

        if expired {
            debug!(card = %self.id_hex(), "TOTP codes expired");
            self.listeners.emit(&YubiKeyEvent::TotpCodesExpired);
        }
        if self.state.borrow().timer.is_none() {
            self.submit_calculate_all();
        }
    }

    fn start_timer(&self, delay: Duration) -> JoinHandle<()> {
        let weak = self.this.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(key) = weak.upgrade() {
                key.on_totp_timer();
            }
        })
    }

    fn on_totp_timer(&self) {
        // This task is about to end, don't abort it
        self.state.borrow_mut().timer.take();
        self.update_totp_timer();
        self.emit_queued();
    }

    /// Standalone CALCULATE ALL for a new period
    fn submit_calculate_all(&self) {
        if self.can_transmit() {
            self.submit(KeyOp::CalculateAll, false, false);
        }
    }

    fn operation(&self, op: KeyOp, requires_select: bool) -> Option<(Rc<TagSession>, Rc<Operation>)> {
        let state = self.state.borrow();
        let binding = state.binding.as_ref()?;
        let job = KeyJob::new(self.this.clone(), op);
        let op = Operation::new(Kind::Key(job), requires_select, &binding.cancel);
        Some((binding.session.clone(), op))
    }

    fn submit(&self, op: KeyOp, requires_select: bool, to_front: bool) -> Option<u32> {
        let (session, op) = self.operation(op, requires_select)?;
        Some(session.submit(op, to_front))
    }

    fn submit_unique(&self, op: KeyOp, requires_select: bool, to_front: bool) -> Option<u32> {
        let (session, op) = self.operation(op, requires_select)?;
        Some(session.submit_unique(op, to_front))
    }

    fn emit_queued(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.emitting {
                return;
            }
            state.emitting = true;
        }
        loop {
            let signal = self.state.borrow_mut().signals.pop_first();
            match signal {
                Some(signal) => self.listeners.emit(&signal.into()),
                None => break,
            }
        }
        self.state.borrow_mut().emitting = false;
    }
}

impl Drop for YubiKey {
    fn drop(&mut self) {
        debug!(card = %self.id_hex(), "Dropped");
        let state = self.state.get_mut();
        state.stop_timer();
        if let Some(binding) = state.binding.take() {
            binding.cancel.cancel();
            binding.session.unsubscribe(binding.listener);
        }
        if let Some(listener) = self.key_listener.take() {
            self.context.keystore.unsubscribe(listener);
        }
    }
}

fn name_bytes(names: &[String]) -> Vec<Vec<u8>> {
    names
        .iter()
        .map(|name| card_name(name).as_bytes().to_vec())
        .collect()
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
