//! Card facade
//!
//! [`YubiKeyCard`] gives a consumer stable properties for whichever card it
//! is pointed at. Switching to another card id reports exactly the
//! properties that differ between the two cards.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::context::OathContext;
use crate::events::{ListenerId, Listeners};
use crate::yubikey::{YubiKey, YubiKeyEvent};
use crate::{AuthAccess, Error, OtpEntry, Result, Token, Version, YubiKeyState};

/// Notifications of a [`YubiKeyCard`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardEvent {
    /// Bound to another card id
    YubiKeyIdChanged,
    /// Firmware version changed
    YubiKeyVersionChanged,
    /// Raw credential list changed
    OtpListChanged,
    /// Raw codes changed
    OtpDataChanged,
    /// Summary state changed
    YubiKeyStateChanged,
    /// Authorization changed
    AuthAccessChanged,
    /// Set of refreshable credentials changed
    RefreshableTokensChanged,
    /// Set of in-flight operations changed
    OperationIdsChanged,
    /// Card came or went
    PresentChanged,
    /// The credential list has been read
    OtpListFetchedChanged,
    /// Seconds left in the TOTP period changed
    TotpTimeLeftChanged,
    /// TOTP codes became valid or expired
    TotpValidChanged,
    /// An operation finished
    OperationFinished {
        /// Operation id
        id: u32,
        /// Whether it completed successfully
        success: bool,
    },
    /// The card rejected our access key
    AccessKeyNotAccepted,
    /// The TOTP period rolled over
    TotpCodesExpired,
    /// A new access code was set
    PasswordChanged,
    /// The access code was removed
    PasswordRemoved,
    /// The applet was factory reset
    YubiKeyReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Signal {
    YubiKeyId,
    YubiKeyVersion,
    OtpList,
    OtpData,
    YubiKeyState,
    AuthAccess,
    RefreshableTokens,
    OperationIds,
    Present,
    OtpListFetched,
    TotpTimeLeft,
    TotpValid,
}

impl From<Signal> for CardEvent {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::YubiKeyId => Self::YubiKeyIdChanged,
            Signal::YubiKeyVersion => Self::YubiKeyVersionChanged,
            Signal::OtpList => Self::OtpListChanged,
            Signal::OtpData => Self::OtpDataChanged,
            Signal::YubiKeyState => Self::YubiKeyStateChanged,
            Signal::AuthAccess => Self::AuthAccessChanged,
            Signal::RefreshableTokens => Self::RefreshableTokensChanged,
            Signal::OperationIds => Self::OperationIdsChanged,
            Signal::Present => Self::PresentChanged,
            Signal::OtpListFetched => Self::OtpListFetchedChanged,
            Signal::TotpTimeLeft => Self::TotpTimeLeftChanged,
            Signal::TotpValid => Self::TotpValidChanged,
        }
    }
}

/// Properties compared when switching cards
#[derive(Debug, Default, PartialEq, Eq)]
struct Snapshot {
    version: Option<Version>,
    otp_list: Vec<u8>,
    otp_data: Vec<u8>,
    auth_access: AuthAccess,
    refreshable: Vec<String>,
    operation_ids: Vec<u32>,
    present: bool,
    otp_list_fetched: bool,
    totp_time_left: u32,
    totp_valid: bool,
}

impl Snapshot {
    fn of(key: Option<&YubiKey>) -> Self {
        key.map_or_else(Self::default, |key| Self {
            version: key.version(),
            otp_list: key.otp_list(),
            otp_data: key.otp_data(),
            auth_access: key.auth_access(),
            refreshable: key.refreshable_tokens(),
            operation_ids: key.operation_ids(),
            present: key.present(),
            otp_list_fetched: key.otp_list_fetched(),
            totp_time_left: key.totp_time_left(),
            totp_valid: key.totp_valid(),
        })
    }

    fn diff(&self, other: &Self) -> impl Iterator<Item = Signal> {
        [
            (self.version != other.version, Signal::YubiKeyVersion),
            (self.otp_list != other.otp_list, Signal::OtpList),
            (self.otp_data != other.otp_data, Signal::OtpData),
            (self.auth_access != other.auth_access, Signal::AuthAccess),
            (self.refreshable != other.refreshable, Signal::RefreshableTokens),
            (self.operation_ids != other.operation_ids, Signal::OperationIds),
            (self.present != other.present, Signal::Present),
            (self.otp_list_fetched != other.otp_list_fetched, Signal::OtpListFetched),
            (self.totp_time_left != other.totp_time_left, Signal::TotpTimeLeft),
            (self.totp_valid != other.totp_valid, Signal::TotpValid),
        ]
        .into_iter()
        .filter_map(|(changed, signal)| changed.then_some(signal))
    }
}

struct Bound {
    key: Rc<YubiKey>,
    listener: ListenerId,
}

/// Consumer view of one card, addressed by card id
pub struct YubiKeyCard {
    context: OathContext,
    this: Weak<Self>,
    bound: RefCell<Option<Bound>>,
    state: Cell<YubiKeyState>,
    signals: RefCell<BTreeSet<Signal>>,
    emitting: Cell<bool>,
    listeners: Listeners<CardEvent>,
}

impl fmt::Debug for YubiKeyCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YubiKeyCard")
            .field("yubikey_id", &self.yubikey_id())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl YubiKeyCard {
    /// Facade not bound to any card yet
    pub fn new(context: &OathContext) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            context: context.clone(),
            this: this.clone(),
            bound: RefCell::new(None),
            state: Cell::new(YubiKeyState::Idle),
            signals: RefCell::new(BTreeSet::new()),
            emitting: Cell::new(false),
            listeners: Listeners::new(),
        })
    }

    fn key(&self) -> Option<Rc<YubiKey>> {
        self.bound.borrow().as_ref().map(|bound| bound.key.clone())
    }

    /// Bind to the card with `card_id`, or unbind if it's empty
    pub fn set_yubikey_id(&self, card_id: &[u8]) {
        let previous = self.key();
        if previous.as_ref().map(|key| key.id()).unwrap_or_default() == card_id {
            return;
        }
        debug!(card = %hex::encode(card_id), "Rebinding");

        let before = Snapshot::of(previous.as_deref());
        drop(previous);
        if let Some(bound) = self.bound.borrow_mut().take() {
            bound.key.unsubscribe(bound.listener);
        }
        self.queue(Signal::YubiKeyId);

        if !card_id.is_empty() {
            let key = self.context.yubikey(card_id);
            let weak = self.this.clone();
            let listener = key.subscribe(move |event| {
                if let Some(card) = weak.upgrade() {
                    card.on_yubikey_event(*event);
                }
            });
            *self.bound.borrow_mut() = Some(Bound { key, listener });
        }

        let after = Snapshot::of(self.key().as_deref());
        before.diff(&after).for_each(|signal| self.queue(signal));

        // The summary state starts over for every card
        let state = self.state.replace(YubiKeyState::Idle);
        let next = YubiKeyState::Idle.next(after.auth_access);
        self.state.set(next);
        if next != state {
            self.queue(Signal::YubiKeyState);
        }
        self.emit_queued();
    }

    /// Hex id of the bound card, empty if none
    pub fn yubikey_id(&self) -> String {
        self.key().map(|key| key.id_hex()).unwrap_or_default()
    }

    /// Firmware version as `a.b.c`, empty if unknown
    pub fn yubikey_version(&self) -> String {
        self.key()
            .and_then(|key| key.version())
            .map(|version| version.to_string())
            .unwrap_or_default()
    }

    /// Summary state
    pub fn yubikey_state(&self) -> YubiKeyState {
        self.state.get()
    }

    /// Whether the bound card is on the active tag
    pub fn present(&self) -> bool {
        self.key().is_some_and(|key| key.present())
    }

    /// Authorization of the bound card
    pub fn auth_access(&self) -> AuthAccess {
        self.key().map(|key| key.auth_access()).unwrap_or_default()
    }

    /// Raw credential list, hex encoded
    pub fn otp_list(&self) -> String {
        self.key().map(|key| hex::encode(key.otp_list())).unwrap_or_default()
    }

    /// Raw codes, hex encoded
    pub fn otp_data(&self) -> String {
        self.key().map(|key| hex::encode(key.otp_data())).unwrap_or_default()
    }

    /// Credentials with their codes
    pub fn entries(&self) -> Vec<OtpEntry> {
        self.key().map(|key| key.entries()).unwrap_or_default()
    }

    /// Whether the credential list has been read
    pub fn otp_list_fetched(&self) -> bool {
        self.key().is_some_and(|key| key.otp_list_fetched())
    }

    /// Names of credentials needing an explicit refresh
    pub fn refreshable_tokens(&self) -> Vec<String> {
        self.key().map(|key| key.refreshable_tokens()).unwrap_or_default()
    }

    /// Ids of operations in flight
    pub fn operation_ids(&self) -> Vec<u32> {
        self.key().map(|key| key.operation_ids()).unwrap_or_default()
    }

    /// Whether operation `id` is in flight
    pub fn valid_operation_id(&self, id: u32) -> bool {
        self.operation_ids().contains(&id)
    }

    /// Whether the codes are current
    pub fn totp_valid(&self) -> bool {
        self.key().is_some_and(|key| key.totp_valid())
    }

    /// Seconds until the codes expire
    pub fn totp_time_left(&self) -> u32 {
        self.key().map(|key| key.totp_time_left()).unwrap_or_default()
    }

    fn present_key(&self) -> Result<Rc<YubiKey>> {
        self.key().filter(|key| key.present()).ok_or(Error::NotPresent)
    }

    /// Store a credential
    pub fn put_token(&self, token: &Token) -> Result<u32> {
        self.present_key()?.put_token(token)
    }

    /// Store several credentials
    pub fn put_tokens(&self, tokens: &[Token]) -> Result<u32> {
        self.present_key()?.put_tokens(tokens)
    }

    /// Set the access code, an empty one removes it
    pub fn set_password(&self, password: &str) -> Result<u32> {
        self.present_key()?.set_password(password)
    }

    /// Factory reset the applet
    pub fn reset(&self) -> Result<u32> {
        self.present_key()?.reset()
    }

    /// Recalculate codes that are not calculated in bulk
    pub fn refresh_tokens(&self, names: &[String]) -> Option<u32> {
        self.key()?.refresh_tokens(names)
    }

    /// Delete credentials
    pub fn delete_tokens(&self, names: &[String]) -> Option<u32> {
        self.key()?.delete_tokens(names)
    }

    /// Remember the access code of the bound card
    pub fn submit_password(&self, password: &str, persist: bool) -> Result<()> {
        self.key()
            .ok_or(Error::NotPresent)?
            .submit_password(password, persist)
    }

    /// Register a listener
    pub fn subscribe(&self, callback: impl Fn(&CardEvent) + 'static) -> ListenerId {
        self.listeners.add(callback)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    /// Stream of events, until the receiver is dropped
    pub fn events(&self) -> mpsc::UnboundedReceiver<CardEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Rc::new(Cell::new(None));
        let weak = self.this.clone();
        let own_id = id.clone();
        let listener = self.listeners.add(move |event| {
            if tx.send(*event).is_err() {
                if let (Some(card), Some(id)) = (weak.upgrade(), own_id.get()) {
                    card.unsubscribe(id);
                }
            }
        });
        id.set(Some(listener));
        rx
    }

    fn on_yubikey_event(&self, event: YubiKeyEvent) {
        let forwarded = match event {
            YubiKeyEvent::VersionChanged => Some(Signal::YubiKeyVersion),
            YubiKeyEvent::OtpListFetchedChanged => Some(Signal::OtpListFetched),
            YubiKeyEvent::OtpListChanged => Some(Signal::OtpList),
            YubiKeyEvent::OtpDataChanged => Some(Signal::OtpData),
            YubiKeyEvent::PresentChanged => Some(Signal::Present),
            YubiKeyEvent::AuthAccessChanged => Some(Signal::AuthAccess),
            YubiKeyEvent::RefreshableTokensChanged => Some(Signal::RefreshableTokens),
            YubiKeyEvent::OperationIdsChanged => Some(Signal::OperationIds),
            YubiKeyEvent::TotpTimeLeftChanged => Some(Signal::TotpTimeLeft),
            YubiKeyEvent::TotpValidChanged => Some(Signal::TotpValid),
            YubiKeyEvent::AccessKeyNotAccepted => {
                self.listeners.emit(&CardEvent::AccessKeyNotAccepted);
                None
            }
            YubiKeyEvent::OperationFinished { id, success } => {
                self.listeners.emit(&CardEvent::OperationFinished { id, success });
                None
            }
            YubiKeyEvent::TotpCodesExpired => {
                self.listeners.emit(&CardEvent::TotpCodesExpired);
                None
            }
            YubiKeyEvent::PasswordChanged => {
                self.listeners.emit(&CardEvent::PasswordChanged);
                None
            }
            YubiKeyEvent::PasswordRemoved => {
                self.listeners.emit(&CardEvent::PasswordRemoved);
                None
            }
            YubiKeyEvent::YubiKeyReset => {
                self.listeners.emit(&CardEvent::YubiKeyReset);
                None
            }
        };
        if let Some(signal) = forwarded {
            self.queue(signal);
            if matches!(signal, Signal::AuthAccess | Signal::Present) {
                self.update_state();
            }
        }
        self.emit_queued();
    }

    fn update_state(&self) {
        let state = self.state.get();
        let next = state.next(self.auth_access());
        if next != state {
            debug!(from = %state, to = %next, "Card state");
            self.state.set(next);
            self.queue(Signal::YubiKeyState);
        }
    }

    fn queue(&self, signal: Signal) {
        self.signals.borrow_mut().insert(signal);
    }

    fn emit_queued(&self) {
        if self.emitting.replace(true) {
            return;
        }
        loop {
            let signal = self.signals.borrow_mut().pop_first();
            match signal {
                Some(signal) => self.listeners.emit(&signal.into()),
                None => break,
            }
        }
        self.emitting.set(false);
    }
}

impl Drop for YubiKeyCard {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.get_mut().take() {
            bound.key.unsubscribe(bound.listener);
        }
    }
}
