//! Bodies of the YubiKey operations
//!
//! Each body runs once its operation owns the tag, with the applet selected.

use std::rc::Weak;

use tracing::{debug, warn};
use ykoath_apdu_core::{Command, StatusWord, tlv};

use super::{Signal, YubiKey, YubiKeyEvent};
use crate::commands;
use crate::constants::tags;
use crate::crypto::{compute_response, random_challenge};
use crate::operation::Exchange;
use crate::{AuthAccess, Error, Result, Token};

pub(super) enum KeyOp {
    Authorize,
    List,
    CalculateAll,
    Refresh(Vec<Vec<u8>>),
    Put(Token),
    Delete(Vec<Vec<u8>>),
    SetCode(Command),
    RemoveCode,
    Reset,
}

impl KeyOp {
    const fn name(&self) -> &'static str {
        match self {
            Self::Authorize => "Authorize",
            Self::List => "List",
            Self::CalculateAll => "CalculateAll",
            Self::Refresh(_) => "Refresh",
            Self::Put(_) => "Put",
            Self::Delete(_) => "Delete",
            Self::SetCode(_) => "SetCode",
            Self::RemoveCode => "RemoveCode",
            Self::Reset => "Reset",
        }
    }
}

/// Operation body on behalf of a [`YubiKey`]
pub(crate) struct KeyJob {
    key: Weak<YubiKey>,
    op: KeyOp,
}

impl KeyJob {
    pub(super) const fn new(key: Weak<YubiKey>, op: KeyOp) -> Self {
        Self { key, op }
    }

    pub(crate) const fn name(&self) -> &'static str {
        self.op.name()
    }

    pub(crate) async fn run(self, exchange: &Exchange) -> Result<bool> {
        let key = self.key.upgrade().ok_or(Error::Cancelled)?;
        if exchange.session()?.card_id() != key.id {
            debug!(op = self.op.name(), card = %key.id_hex(), "Tag holds another card");
            return Ok(false);
        }

        // SELECT drops the authentication of a protected applet, RESET
        // doesn't need it
        if exchange.selected && !matches!(self.op, KeyOp::Authorize | KeyOp::Reset) {
            match key.validate(exchange).await? {
                Validation::Open | Validation::Granted => {}
                Validation::NoKey | Validation::Denied(_) => {
                    debug!(op = self.op.name(), card = %key.id_hex(), "Not authorized after SELECT");
                    return Ok(false);
                }
            }
        }

        let result = match self.op {
            KeyOp::Authorize => key.authorize(exchange).await,
            KeyOp::List => key.list(exchange).await,
            KeyOp::CalculateAll => key.calculate_all(exchange, false).await,
            KeyOp::Refresh(names) => key.refresh(exchange, &names).await,
            KeyOp::Put(token) => key.put(exchange, &token).await,
            KeyOp::Delete(names) => key.delete(exchange, &names).await,
            KeyOp::SetCode(command) => key.set_code(exchange, &command, false).await,
            KeyOp::RemoveCode => key.set_code(exchange, &commands::remove_code(), true).await,
            KeyOp::Reset => key.factory_reset(exchange).await,
        };
        key.emit_queued();
        result
    }
}

/// Outcome of authenticating to the applet
enum Validation {
    /// No access code set
    Open,
    /// No key stored for the card
    NoKey,
    /// Both sides proved they know the key
    Granted,
    /// The card rejected our response, or failed to prove itself
    Denied(StatusWord),
}

impl YubiKey {
    /// Answer the pending challenge with the stored key
    async fn validate(&self, exchange: &Exchange) -> Result<Validation> {
        let session = exchange.session()?;
        let challenge = session.challenge();
        if challenge.is_empty() {
            return Ok(Validation::Open);
        }
        let algorithm = session.algorithm().unwrap_or_default();
        drop(session);

        let Some(access_key) = self.context.keystore.get(&self.id, algorithm) else {
            debug!(card = %self.id_hex(), %algorithm, "No access key");
            return Ok(Validation::NoKey);
        };

        let response = compute_response(&access_key, algorithm, &challenge)?;
        let host_challenge = random_challenge();
        let reply = exchange
            .send(&commands::validate(&response, &host_challenge))
            .await?;

        let status = reply.status();
        if status.is_success() || status.is_auth_not_enabled() {
            let expected = compute_response(&access_key, algorithm, &host_challenge)?;
            if tlv::find(reply.payload(), tags::RESPONSE_FULL) == Some(&expected[..]) {
                return Ok(Validation::Granted);
            }
            warn!(card = %self.id_hex(), "Card failed to prove it knows the key");
        }
        Ok(Validation::Denied(status))
    }

    /// Mutual authentication with the stored key
    async fn authorize(&self, exchange: &Exchange) -> Result<bool> {
        match self.validate(exchange).await? {
            Validation::Open => self.authorized(AuthAccess::Open),
            Validation::Granted => self.authorized(AuthAccess::Granted),
            Validation::NoKey => self.update_auth_access(AuthAccess::Denied),
            Validation::Denied(status) => {
                self.update_auth_access(AuthAccess::Denied);
                if status.is_wrong_syntax() {
                    debug!(card = %self.id_hex(), "Access key not accepted");
                    self.forget_access_keys();
                    self.state
                        .borrow_mut()
                        .signals
                        .insert(Signal::AccessKeyNotAccepted);
                }
            }
        }
        Ok(true)
    }

    /// Drop the stored keys of this card without reacting to the change
    fn forget_access_keys(&self) {
        self.state.borrow_mut().ignore_key_changes = true;
        let cleared = self.context.keystore.clear(&self.id);
        self.state.borrow_mut().ignore_key_changes = false;
        if let Err(e) = cleared {
            warn!(card = %self.id_hex(), "Failed to clear access keys: {}", e);
        }
    }

    /// LIST, then CALCULATE ALL in the same operation
    async fn list(&self, exchange: &Exchange) -> Result<bool> {
        let otp_list = exchange.send_ok(&commands::LIST).await?;
        let empty = otp_list.is_empty();
        self.update_otp_list(otp_list.to_vec());
        self.set_otp_list_fetched();
        if empty {
            self.update_otp_data(Vec::new());
            return Ok(true);
        }
        self.calculate_all(exchange, true).await
    }

    async fn calculate_all(&self, exchange: &Exchange, listed: bool) -> Result<bool> {
        let period = self.current_period();
        self.state.borrow_mut().last_requested_period = period;
        let otp_data = exchange.send_ok(&commands::calculate_all(period)).await?;

        // Access may have been lost while this was queued
        if !listed && !self.have_access() {
            debug!(card = %self.id_hex(), "Dropping codes, no access");
            return Ok(true);
        }
        self.calculate_all_ok(otp_data.to_vec());
        Ok(true)
    }

    /// CALCULATE each credential, merging the results into the codes
    ///
    /// Card errors skip to the next credential, transport errors end the
    /// operation.
    async fn refresh(&self, exchange: &Exchange, names: &[Vec<u8>]) -> Result<bool> {
        let period = self.state.borrow().last_requested_period;
        let mut success = true;
        for name in names {
            let reply = exchange.send(&commands::calculate(name, period)).await?;
            if !reply.is_success() {
                warn!(
                    name = %String::from_utf8_lossy(name),
                    "CALCULATE failed: {}",
                    reply.status()
                );
                success = false;
                continue;
            }
            let mut payload: &[u8] = reply.payload();
            match tlv::read(&mut payload) {
                Some(record) if record.tag == tags::RESPONSE_FULL => {
                    self.merge_otp_code(name, record.value);
                }
                _ => warn!(name = %String::from_utf8_lossy(name), "Unexpected CALCULATE response"),
            }
        }
        Ok(success)
    }

    async fn put(&self, exchange: &Exchange, token: &Token) -> Result<bool> {
        exchange.send_ok(&commands::put(token)?).await?;
        debug!(card = %self.id_hex(), name = %token.name(), "Stored credential");
        self.request_list(false);
        Ok(true)
    }

    async fn delete(&self, exchange: &Exchange, names: &[Vec<u8>]) -> Result<bool> {
        for name in names {
            let reply = exchange.send(&commands::delete(name)).await?;
            if reply.is_success() {
                debug!(name = %String::from_utf8_lossy(name), "Deleted");
            } else {
                warn!(
                    name = %String::from_utf8_lossy(name),
                    "DELETE failed: {}",
                    reply.status()
                );
            }
        }
        self.request_list(true);
        Ok(true)
    }

    async fn set_code(&self, exchange: &Exchange, command: &Command, remove: bool) -> Result<bool> {
        exchange.send_ok(command).await?;

        // The recheck below covers the keys going away
        self.forget_access_keys();

        self.recheck_authorization();
        self.listeners.emit(&if remove {
            YubiKeyEvent::PasswordRemoved
        } else {
            YubiKeyEvent::PasswordChanged
        });
        Ok(true)
    }

    async fn factory_reset(&self, exchange: &Exchange) -> Result<bool> {
        exchange.send_ok(&commands::RESET).await?;
        debug!(card = %self.id_hex(), "Applet reset");
        if let Err(e) = self.context.keystore.purge(&self.id) {
            warn!(card = %self.id_hex(), "Failed to purge card directory: {}", e);
        }
        // The new SELECT reports a new id
        self.recheck_authorization();
        self.listeners.emit(&YubiKeyEvent::YubiKeyReset);
        Ok(true)
    }
}
