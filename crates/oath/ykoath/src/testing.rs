//! Simulated OATH applet
//!
//! [`FakeOathCard`] answers the YKOATH instruction set the way a YubiKey
//! does, closely enough to run the session and card logic against it.
//! Responses longer than the configured chunk size are chained with `61 XX`.

use std::cell::{Cell, RefCell};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use ykoath_apdu_core::{CancelToken, IsoDepTransport, TagLock, TransportError, WeakTagLock, tlv};

use crate::constants::{PROP_REQUIRE_TOUCH, TYPE_MASK, ins, tags};
use crate::crypto::{AccessKey, derive_key, hmac, random_challenge};
use crate::{Algorithm, Token, TokenType, truncate};

const SW_OK: u16 = 0x9000;
const SW_AUTH_REQUIRED: u16 = 0x6982;
const SW_NO_SUCH_OBJECT: u16 = 0x6984;
const SW_WRONG_SYNTAX: u16 = 0x6A80;
const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;

#[derive(Debug, Clone)]
struct Credential {
    name: Vec<u8>,
    type_alg: u8,
    digits: u8,
    secret: Vec<u8>,
    touch: bool,
    counter: u32,
}

impl Credential {
    fn algorithm(&self) -> Algorithm {
        Algorithm::from_byte(self.type_alg).unwrap_or_default()
    }

    fn is_hotp(&self) -> bool {
        self.type_alg & TYPE_MASK == TokenType::Hotp.to_byte()
    }
}

#[derive(Debug)]
struct Applet {
    id: Vec<u8>,
    version: [u8; 3],
    access: Option<(Algorithm, AccessKey)>,
    challenge: Vec<u8>,
    authenticated: bool,
    credentials: Vec<Credential>,
}

impl Applet {
    fn locked(&self) -> bool {
        self.access.is_some() && !self.authenticated
    }
}

/// In-memory OATH applet behind an [`IsoDepTransport`]
#[derive(Debug)]
pub struct FakeOathCard {
    applet: RefCell<Applet>,
    chunk: Cell<usize>,
    remaining: RefCell<Bytes>,
    commands: RefCell<Vec<Bytes>>,
    lock: RefCell<WeakTagLock>,
    failures: RefCell<Vec<TransportError>>,
}

impl FakeOathCard {
    /// Applet with id `card_id`, no access code and no credentials
    pub fn new(card_id: &[u8]) -> Self {
        Self {
            applet: RefCell::new(Applet {
                id: card_id.to_vec(),
                version: [5, 4, 3],
                access: None,
                challenge: Vec::new(),
                authenticated: false,
                credentials: Vec::new(),
            }),
            chunk: Cell::new(0xFF),
            remaining: RefCell::new(Bytes::new()),
            commands: RefCell::new(Vec::new()),
            lock: RefCell::new(WeakTagLock::default()),
            failures: RefCell::new(Vec::new()),
        }
    }

    /// Protect the applet with the key derived from `password`
    pub fn with_password(self, algorithm: Algorithm, password: &str) -> Self {
        {
            let mut applet = self.applet.borrow_mut();
            let key = derive_key(&applet.id, algorithm, password);
            applet.access = Some((algorithm, key));
        }
        self
    }

    /// Store a credential
    pub fn with_token(self, token: &Token) -> Self {
        self.applet.borrow_mut().credentials.push(Credential {
            name: token.name().into_bytes(),
            type_alg: token.token_type.to_byte() | token.algorithm.to_byte(),
            digits: token.digits,
            secret: token.secret.to_vec(),
            touch: token.require_touch,
            counter: token.counter,
        });
        self
    }

    /// Chain responses whose payload exceeds `chunk` bytes
    pub fn with_chunk(self, chunk: usize) -> Self {
        self.chunk.set(chunk.max(1));
        self
    }

    /// Fail the next exchange with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.failures.borrow_mut().push(error);
    }

    /// Current card id, changes on RESET
    pub fn card_id(&self) -> Vec<u8> {
        self.applet.borrow().id.clone()
    }

    /// Whether an access code is set
    pub fn has_password(&self) -> bool {
        self.applet.borrow().access.is_some()
    }

    /// Names of the stored credentials
    pub fn credential_names(&self) -> Vec<String> {
        self.applet
            .borrow()
            .credentials
            .iter()
            .map(|cred| String::from_utf8_lossy(&cred.name).into_owned())
            .collect()
    }

    /// Commands received so far, serialized
    pub fn commands(&self) -> Vec<Bytes> {
        self.commands.borrow().clone()
    }

    /// Instruction bytes received so far
    pub fn instructions(&self) -> Vec<u8> {
        self.commands
            .borrow()
            .iter()
            .filter_map(|command| command.get(1).copied())
            .collect()
    }

    /// Forget the recorded commands
    pub fn clear_commands(&self) {
        self.commands.borrow_mut().clear();
    }

    /// Whether a lock handle is alive
    pub fn is_locked(&self) -> bool {
        self.lock.borrow().upgrade().is_some()
    }

    fn process(&self, apdu: &[u8]) -> Bytes {
        let [_, ins, p1, p2, rest @ ..] = apdu else {
            return status(SW_WRONG_SYNTAX);
        };
        let data = match rest.split_first() {
            Some((&len, data)) => data.get(..usize::from(len)).unwrap_or(data),
            None => &[],
        };

        if *ins == ins::SEND_REMAINING {
            let remaining = std::mem::take(&mut *self.remaining.borrow_mut());
            return self.chain(remaining);
        }
        self.remaining.borrow_mut().clear();

        let mut applet = self.applet.borrow_mut();
        let result = match (*ins, *p1, *p2) {
            (ins::SELECT, 0x04, _) => Ok(select(&mut applet)),
            (ins::VALIDATE, ..) => validate(&mut applet, data),
            (ins::RESET, 0xDE, 0xAD) => {
                applet.id = random_challenge().to_vec();
                applet.access = None;
                applet.authenticated = false;
                applet.credentials.clear();
                Ok(Bytes::new())
            }
            _ if applet.locked() => Err(SW_AUTH_REQUIRED),
            (ins::LIST, ..) => Ok(list(&applet)),
            (ins::CALCULATE_ALL, 0x00, _) => calculate_all(&applet, data),
            (ins::CALCULATE, ..) => calculate(&mut applet, data),
            (ins::PUT, ..) => put(&mut applet, data),
            (ins::DELETE, ..) => delete(&mut applet, data),
            (ins::SET_CODE, ..) => set_code(&mut applet, data),
            _ => Err(SW_INS_NOT_SUPPORTED),
        };
        drop(applet);

        match result {
            Ok(payload) => self.chain(payload),
            Err(sw) => status(sw),
        }
    }

    fn chain(&self, mut payload: Bytes) -> Bytes {
        let chunk = self.chunk.get();
        let mut out = BytesMut::with_capacity(payload.len().min(chunk) + 2);
        if payload.len() > chunk {
            let rest = payload.split_off(chunk);
            out.put_slice(&payload);
            out.put_u8(0x61);
            out.put_u8(u8::try_from(rest.len()).unwrap_or(0));
            *self.remaining.borrow_mut() = rest;
        } else {
            out.put_slice(&payload);
            out.put_u16(SW_OK);
        }
        out.freeze()
    }
}

fn status(sw: u16) -> Bytes {
    Bytes::copy_from_slice(&sw.to_be_bytes())
}

fn select(applet: &mut Applet) -> Bytes {
    applet.authenticated = false;
    applet.challenge = match applet.access {
        Some(_) => random_challenge().to_vec(),
        None => Vec::new(),
    };
    let mut out = BytesMut::new();
    tlv::append(&mut out, tags::VERSION, &applet.version);
    tlv::append(&mut out, tags::NAME, &applet.id);
    if let Some((algorithm, _)) = &applet.access {
        tlv::append(&mut out, tags::CHALLENGE, &applet.challenge);
        tlv::append(&mut out, tags::ALGORITHM, &[algorithm.to_byte()]);
    }
    out.freeze()
}

fn validate(applet: &mut Applet, data: &[u8]) -> Result<Bytes, u16> {
    let Some((algorithm, key)) = &applet.access else {
        return Err(SW_NO_SUCH_OBJECT);
    };
    let response = tlv::find(data, tags::RESPONSE_FULL).ok_or(SW_WRONG_SYNTAX)?;
    let challenge = tlv::find(data, tags::CHALLENGE).ok_or(SW_WRONG_SYNTAX)?;
    let expected = hmac(*algorithm, key.as_bytes(), &applet.challenge).map_err(|_| SW_WRONG_SYNTAX)?;
    if response != expected.as_slice() {
        return Err(SW_WRONG_SYNTAX);
    }
    let ours = hmac(*algorithm, key.as_bytes(), challenge).map_err(|_| SW_WRONG_SYNTAX)?;
    applet.authenticated = true;
    let mut out = BytesMut::new();
    tlv::append(&mut out, tags::RESPONSE_FULL, &ours);
    Ok(out.freeze())
}

fn list(applet: &Applet) -> Bytes {
    let mut out = BytesMut::new();
    for cred in &applet.credentials {
        let mut value = Vec::with_capacity(cred.name.len() + 1);
        value.push(cred.type_alg);
        value.extend_from_slice(&cred.name);
        tlv::append(&mut out, tags::NAME_LIST, &value);
    }
    out.freeze()
}

fn calculate_all(applet: &Applet, data: &[u8]) -> Result<Bytes, u16> {
    let challenge = tlv::find(data, tags::CHALLENGE).ok_or(SW_WRONG_SYNTAX)?;
    let mut out = BytesMut::new();
    for cred in &applet.credentials {
        tlv::append(&mut out, tags::NAME, &cred.name);
        if cred.is_hotp() {
            tlv::append(&mut out, tags::NO_RESPONSE, &[cred.digits]);
        } else if cred.touch {
            tlv::append(&mut out, tags::RESPONSE_TOUCH, &[cred.digits]);
        } else {
            let mac = hmac(cred.algorithm(), &cred.secret, challenge).map_err(|_| SW_WRONG_SYNTAX)?;
            let code = truncate(&mac).ok_or(SW_WRONG_SYNTAX)?;
            let mut value = vec![cred.digits];
            value.extend_from_slice(&code.to_be_bytes());
            tlv::append(&mut out, tags::RESPONSE_TRUNCATED, &value);
        }
    }
    Ok(out.freeze())
}

fn calculate(applet: &mut Applet, data: &[u8]) -> Result<Bytes, u16> {
    let name = tlv::find(data, tags::NAME).ok_or(SW_WRONG_SYNTAX)?;
    let challenge = tlv::find(data, tags::CHALLENGE).ok_or(SW_WRONG_SYNTAX)?;
    let cred = applet
        .credentials
        .iter_mut()
        .find(|cred| cred.name == name)
        .ok_or(SW_NO_SUCH_OBJECT)?;
    let mac = if cred.is_hotp() {
        let counter = u64::from(cred.counter).to_be_bytes();
        cred.counter = cred.counter.wrapping_add(1);
        hmac(cred.algorithm(), &cred.secret, &counter)
    } else {
        hmac(cred.algorithm(), &cred.secret, challenge)
    }
    .map_err(|_| SW_WRONG_SYNTAX)?;
    let mut value = vec![cred.digits];
    value.extend_from_slice(&mac);
    let mut out = BytesMut::new();
    tlv::append(&mut out, tags::RESPONSE_FULL, &value);
    Ok(out.freeze())
}

fn put(applet: &mut Applet, mut data: &[u8]) -> Result<Bytes, u16> {
    let mut name = None;
    let mut key = None;
    let mut touch = false;
    let mut counter = 0;
    while let Some(&tag) = data.first() {
        // The property record has no length byte
        if tag == tags::PROPERTY {
            let property = data.get(1).ok_or(SW_WRONG_SYNTAX)?;
            touch = property & PROP_REQUIRE_TOUCH != 0;
            data = &data[2..];
            continue;
        }
        let record = tlv::read(&mut data).ok_or(SW_WRONG_SYNTAX)?;
        match record.tag {
            tags::NAME => name = Some(record.value.to_vec()),
            tags::KEY => key = Some(record.value.to_vec()),
            tags::IMF => {
                let bytes: [u8; 4] = record.value.try_into().map_err(|_| SW_WRONG_SYNTAX)?;
                counter = u32::from_be_bytes(bytes);
            }
            _ => return Err(SW_WRONG_SYNTAX),
        }
    }
    let name = name.ok_or(SW_WRONG_SYNTAX)?;
    let key = key.ok_or(SW_WRONG_SYNTAX)?;
    let [type_alg, digits, secret @ ..] = key.as_slice() else {
        return Err(SW_WRONG_SYNTAX);
    };

    let cred = Credential {
        name,
        type_alg: *type_alg,
        digits: *digits,
        secret: secret.to_vec(),
        touch,
        counter,
    };
    match applet.credentials.iter_mut().find(|c| c.name == cred.name) {
        Some(existing) => *existing = cred,
        None => applet.credentials.push(cred),
    }
    Ok(Bytes::new())
}

fn delete(applet: &mut Applet, data: &[u8]) -> Result<Bytes, u16> {
    let name = tlv::find(data, tags::NAME).ok_or(SW_WRONG_SYNTAX)?;
    let pos = applet
        .credentials
        .iter()
        .position(|cred| cred.name == name)
        .ok_or(SW_NO_SUCH_OBJECT)?;
    applet.credentials.remove(pos);
    Ok(Bytes::new())
}

fn set_code(applet: &mut Applet, data: &[u8]) -> Result<Bytes, u16> {
    let key = tlv::find(data, tags::KEY).ok_or(SW_WRONG_SYNTAX)?;
    let Some((&alg, key)) = key.split_first() else {
        applet.access = None;
        return Ok(Bytes::new());
    };
    let algorithm = Algorithm::from_byte(alg).ok_or(SW_WRONG_SYNTAX)?;
    let key = AccessKey::from_slice(key).ok_or(SW_WRONG_SYNTAX)?;
    let challenge = tlv::find(data, tags::CHALLENGE).ok_or(SW_WRONG_SYNTAX)?;
    let response = tlv::find(data, tags::RESPONSE_FULL).ok_or(SW_WRONG_SYNTAX)?;
    let expected = hmac(algorithm, key.as_bytes(), challenge).map_err(|_| SW_WRONG_SYNTAX)?;
    if response != expected.as_slice() {
        return Err(SW_WRONG_SYNTAX);
    }
    applet.access = Some((algorithm, key));
    Ok(Bytes::new())
}

#[async_trait(?Send)]
impl IsoDepTransport for FakeOathCard {
    async fn do_transceive(
        &self,
        command: &[u8],
        _cancel: &CancelToken,
    ) -> Result<Bytes, TransportError> {
        self.commands
            .borrow_mut()
            .push(Bytes::copy_from_slice(command));
        if let Some(error) = self.failures.borrow_mut().pop() {
            return Err(error);
        }
        // Answers arrive asynchronously on a real link
        tokio::task::yield_now().await;
        Ok(self.process(command))
    }

    fn lock(&self) -> Option<TagLock> {
        self.lock.borrow().upgrade()
    }

    async fn acquire_lock(&self, cancel: &CancelToken) -> Result<TagLock, TransportError> {
        cancel.check()?;
        if let Some(lock) = self.lock() {
            return Ok(lock);
        }
        let lock = TagLock::new(());
        *self.lock.borrow_mut() = lock.downgrade();
        Ok(lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands;
    use hex_literal::hex;
    use ykoath_apdu_core::{Response, SendRemainingProcessor};

    async fn send(card: &FakeOathCard, command: &ykoath_apdu_core::Command) -> Response {
        SendRemainingProcessor::new()
            .exchange(card, command, &CancelToken::new())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_chained_list() {
        let card = FakeOathCard::new(&hex!("0102030405060708"))
            .with_token(&Token::totp("first", b"12345678901234567890".to_vec()))
            .with_token(&Token::hotp("second", b"12345678901234567890".to_vec()))
            .with_chunk(5);

        let response = send(&card, &commands::LIST).await;
        assert!(response.is_success());
        assert_eq!(
            commands::list_names(response.payload()),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert!(card.instructions().contains(&ins::SEND_REMAINING));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_locked_until_validated() {
        let card = FakeOathCard::new(&hex!("AABBCC")).with_password(Algorithm::Sha1, "pw");
        send(&card, &commands::select()).await;
        let response = send(&card, &commands::LIST).await;
        assert_eq!(response.status().to_u16(), SW_AUTH_REQUIRED);

        let key = derive_key(&hex!("AABBCC"), Algorithm::Sha1, "pw");
        let challenge = card.applet.borrow().challenge.clone();
        let ours = hmac(Algorithm::Sha1, key.as_bytes(), &challenge).unwrap();
        let response = send(&card, &commands::validate(&ours, &[7; 8])).await;
        assert!(response.is_success());
        let expected = hmac(Algorithm::Sha1, key.as_bytes(), &[7; 8]).unwrap();
        assert_eq!(tlv::find(response.payload(), tags::RESPONSE_FULL), Some(&expected[..]));

        assert!(send(&card, &commands::LIST).await.is_success());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_put_then_delete() {
        let card = FakeOathCard::new(&hex!("AABBCC"));
        let token = Token::hotp("c", b"secret".to_vec()).with_touch(true).with_counter(3);
        assert!(send(&card, &commands::put(&token).unwrap()).await.is_success());
        assert_eq!(card.credential_names(), vec!["c"]);
        {
            let applet = card.applet.borrow();
            let cred = &applet.credentials[0];
            assert!(cred.touch);
            assert_eq!(cred.counter, 3);
            assert_eq!(cred.digits, 6);
            // Zero-padded by the PUT builder
            assert_eq!(cred.secret.len(), 14);
        }

        assert!(send(&card, &commands::delete(b"c")).await.is_success());
        assert!(card.credential_names().is_empty());
        let response = send(&card, &commands::delete(b"c")).await;
        assert_eq!(response.status().to_u16(), SW_NO_SUCH_OBJECT);
    }
}
