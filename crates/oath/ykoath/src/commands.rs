//! APDU catalog of the OATH applet
//!
//! Builders for every command the core sends and parsers for the responses
//! that carry more than a status word.

use bytes::{BufMut, BytesMut};
use tracing::trace;
use ykoath_apdu_core::{Command, tlv};

use crate::constants::{
    CHALLENGE_SIZE, MIN_KEY_SIZE, OATH_AID, PROP_REQUIRE_TOUCH, ins, tags,
};
use crate::crypto::AccessKey;
use crate::{Algorithm, Result, Token, TokenType, Version};

/// Class byte of every OATH command
pub const CLA: u8 = 0x00;

/// LIST
pub const LIST: Command = Command::new(CLA, ins::LIST, 0x00, 0x00);

/// RESET
pub const RESET: Command = Command::new(CLA, ins::RESET, 0xDE, 0xAD);

/// SELECT the OATH applet
pub fn select() -> Command {
    Command::new_with_data(CLA, ins::SELECT, 0x04, 0x00, OATH_AID)
}

/// VALIDATE: our response to the card challenge and a challenge for the card
pub fn validate(response: &[u8], challenge: &[u8]) -> Command {
    let mut data = BytesMut::with_capacity(response.len() + challenge.len() + 4);
    tlv::append(&mut data, tags::RESPONSE_FULL, response);
    tlv::append(&mut data, tags::CHALLENGE, challenge);
    Command::new_with_data(CLA, ins::VALIDATE, 0x00, 0x00, data.freeze())
}

/// TOTP challenge of a time step: the period number as 8 big-endian bytes
pub const fn period_challenge(period: u64) -> [u8; CHALLENGE_SIZE] {
    period.to_be_bytes()
}

/// CALCULATE ALL for the given period
pub fn calculate_all(period: u64) -> Command {
    let mut data = BytesMut::with_capacity(CHALLENGE_SIZE + 2);
    tlv::append(&mut data, tags::CHALLENGE, &period_challenge(period));
    Command::new_with_data(CLA, ins::CALCULATE_ALL, 0x00, 0x00, data.freeze())
}

/// CALCULATE of one credential for the given period
pub fn calculate(name: &[u8], period: u64) -> Command {
    let mut data = BytesMut::with_capacity(name.len() + CHALLENGE_SIZE + 4);
    tlv::append(&mut data, tags::NAME, name);
    tlv::append(&mut data, tags::CHALLENGE, &period_challenge(period));
    Command::new_with_data(CLA, ins::CALCULATE, 0x00, 0x00, data.freeze())
}

/// PUT a credential
///
/// The secret is zero-padded to [`MIN_KEY_SIZE`]. The touch property is only
/// sent when requested, the counter only for HOTP. Fails for a credential
/// that [`Token::validate`] rejects.
pub fn put(token: &Token) -> Result<Command> {
    token.validate()?;
    let name = token.name();
    let key_size = token.secret.len().max(MIN_KEY_SIZE);

    let mut key = BytesMut::with_capacity(key_size + 2);
    key.put_u8(token.token_type.to_byte() | token.algorithm.to_byte());
    key.put_u8(token.digits);
    key.put_slice(&token.secret);
    key.put_bytes(0, key_size - token.secret.len());

    let mut data = BytesMut::with_capacity(name.len() + key_size + 16);
    tlv::append(&mut data, tags::NAME, name.as_bytes());
    tlv::append(&mut data, tags::KEY, &key);
    if token.require_touch {
        data.put_u8(tags::PROPERTY);
        data.put_u8(PROP_REQUIRE_TOUCH);
    }
    if token.token_type == TokenType::Hotp {
        tlv::append(&mut data, tags::IMF, &token.counter.to_be_bytes());
    }
    trace!(name = %name, key_size, "PUT payload built");
    Ok(Command::new_with_data(CLA, ins::PUT, 0x00, 0x00, data.freeze()))
}

/// DELETE one credential
pub fn delete(name: &[u8]) -> Command {
    let mut data = BytesMut::with_capacity(name.len() + 2);
    tlv::append(&mut data, tags::NAME, name);
    Command::new_with_data(CLA, ins::DELETE, 0x00, 0x00, data.freeze())
}

/// SET CODE: new key, a challenge and our response to it
pub fn set_code(
    algorithm: Algorithm,
    key: &AccessKey,
    challenge: &[u8],
    response: &[u8],
) -> Command {
    let mut key_data = BytesMut::with_capacity(key.as_bytes().len() + 1);
    key_data.put_u8(algorithm.to_byte());
    key_data.put_slice(key.as_bytes());

    let mut data = BytesMut::with_capacity(key_data.len() + challenge.len() + response.len() + 6);
    tlv::append(&mut data, tags::KEY, &key_data);
    tlv::append(&mut data, tags::CHALLENGE, challenge);
    tlv::append(&mut data, tags::RESPONSE_FULL, response);
    Command::new_with_data(CLA, ins::SET_CODE, 0x00, 0x00, data.freeze())
}

/// SET CODE with an empty key, removing the access code
pub fn remove_code() -> Command {
    let mut data = BytesMut::with_capacity(2);
    tlv::append(&mut data, tags::KEY, &[]);
    Command::new_with_data(CLA, ins::SET_CODE, 0x00, 0x00, data.freeze())
}

/// What the applet reports about itself when selected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectResponse {
    /// Card id, also the salt of access keys
    pub card_id: Vec<u8>,
    /// Raw firmware version
    pub version: Vec<u8>,
    /// Authentication challenge, empty if no access code is set
    pub challenge: Vec<u8>,
    /// Access key algorithm, if reported
    pub algorithm: Option<Algorithm>,
}

impl SelectResponse {
    /// Parse the SELECT payload, ignoring unknown records
    pub fn parse(payload: &[u8]) -> Self {
        let mut response = Self::default();
        for record in tlv::iter(payload) {
            match record.tag {
                tags::NAME => response.card_id = record.value.to_vec(),
                tags::VERSION => response.version = record.value.to_vec(),
                tags::CHALLENGE => response.challenge = record.value.to_vec(),
                tags::ALGORITHM => {
                    if let [byte] = record.value {
                        response.algorithm = Algorithm::from_byte(*byte);
                    }
                }
                tag => trace!(tag = format_args!("{:#04x}", tag), "Unhandled SELECT record"),
            }
        }
        response
    }

    /// Decoded firmware version
    pub fn firmware_version(&self) -> Option<Version> {
        Version::from_bytes(&self.version)
    }
}

/// Names in a LIST payload, in card order
pub fn list_names(payload: &[u8]) -> Vec<Vec<u8>> {
    tlv::iter(payload)
        .filter(|record| record.tag == tags::NAME_LIST)
        .filter_map(|record| record.value.split_first().map(|(_, name)| name.to_vec()))
        .collect()
}

/// Replace the response record following credential `name` with a full
/// response record carrying `response`
///
/// Returns `None` if `name` is not in `otp_data` or is not followed by a
/// response record.
pub fn merge_code(otp_data: &[u8], name: &[u8], response: &[u8]) -> Option<Vec<u8>> {
    let mut iter = tlv::iter(otp_data);
    while let Some(record) = iter.next() {
        if record.tag != tags::NAME || record.value != name {
            continue;
        }
        let offset = otp_data.len() - iter.remaining().len();
        let next = iter.next()?;
        if !matches!(
            next.tag,
            tags::RESPONSE_FULL | tags::RESPONSE_TRUNCATED | tags::NO_RESPONSE | tags::RESPONSE_TOUCH
        ) {
            return None;
        }

        let mut merged = BytesMut::with_capacity(otp_data.len() + response.len());
        merged.put_slice(&otp_data[..offset]);
        tlv::append(&mut merged, tags::RESPONSE_FULL, response);
        merged.put_slice(iter.remaining());
        return Some(merged.to_vec());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_fixed_commands() {
        assert_eq!(select().to_bytes().as_ref(), hex!("00A4040007A0000005272101"));
        assert_eq!(LIST.to_bytes().as_ref(), hex!("00A10000"));
        assert_eq!(RESET.to_bytes().as_ref(), hex!("0004DEAD"));
        assert_eq!(remove_code().to_bytes().as_ref(), hex!("00030000027300"));
    }

    #[test]
    fn test_validate_payload() {
        let cmd = validate(&hex!("0102"), &hex!("0A0B0C0D0E0F1011"));
        assert_eq!(
            cmd.to_bytes().as_ref(),
            hex!("00A300000E 75020102 74080A0B0C0D0E0F1011")
        );
    }

    #[test]
    fn test_calculate_payloads() {
        let cmd = calculate_all(0x0102_0304);
        assert_eq!(
            cmd.to_bytes().as_ref(),
            hex!("00A400000A 7408 0000000001020304")
        );

        let cmd = calculate(b"ab", 1);
        assert_eq!(
            cmd.to_bytes().as_ref(),
            hex!("00A200000E 71026162 7408 0000000000000001")
        );
    }

    #[test]
    fn test_put_totp_payload() {
        let token = Token::totp("ab", hex!("0102030405").to_vec()).with_algorithm(Algorithm::Sha256);
        let cmd = put(&token).unwrap();
        assert_eq!(cmd.ins, ins::PUT);
        assert_eq!(
            cmd.data(),
            hex!(
                "71026162"
                "7310 22 06 0102030405 000000000000000000"
            )
        );
    }

    #[test]
    fn test_put_hotp_payload() {
        let secret = hex!("3132333435363738393031323334353637383930");
        let token = Token::hotp("c", secret.to_vec())
            .with_digits(8)
            .with_counter(0x0102)
            .with_touch(true);
        let cmd = put(&token).unwrap();
        let mut expected = hex!("710163 7316 11 08").to_vec();
        expected.extend_from_slice(&secret);
        expected.extend_from_slice(&hex!("7802 7A04 00000102"));
        assert_eq!(cmd.data(), &expected[..]);
    }

    #[test]
    fn test_put_rejects_oversized_secret() {
        let token = Token::totp("ab", vec![0x42; 300]);
        assert!(matches!(put(&token), Err(crate::Error::InvalidToken(_))));
        assert!(put(&Token::totp("ab", vec![0x42; 248])).is_err());
        // Largest secret whose PUT still fits a short APDU
        let cmd = put(&Token::totp("ab", vec![0x42; 247])).unwrap();
        assert_eq!(cmd.data().len(), 255);
        assert_eq!(&cmd.data()[4..6], hex!("73F9"));
    }

    #[test]
    fn test_delete_payload() {
        assert_eq!(delete(b"x").to_bytes().as_ref(), hex!("0002000003710178"));
    }

    #[test]
    fn test_set_code_payload() {
        let key = AccessKey::new([0x11; 16]);
        let cmd = set_code(Algorithm::Sha1, &key, &[0xCC; 8], &[0xDD; 20]);
        let data = cmd.data();
        assert_eq!(&data[..3], hex!("731101"));
        assert_eq!(&data[3..19], [0x11; 16]);
        assert_eq!(&data[19..21], hex!("7408"));
        assert_eq!(&data[29..31], hex!("7514"));
        assert_eq!(data.len(), 31 + 20);
    }

    #[test]
    fn test_parse_select() {
        let payload = hex!("7903040201 7103AABBCC 7408 0102030405060708 7B01 01 7F00");
        let response = SelectResponse::parse(&payload);
        assert_eq!(response.card_id, hex!("AABBCC"));
        assert_eq!(response.firmware_version().unwrap().to_string(), "4.2.1");
        assert_eq!(response.challenge, hex!("0102030405060708"));
        assert_eq!(response.algorithm, Some(Algorithm::Sha1));

        let response = SelectResponse::parse(&hex!("7903050403 7102 0102"));
        assert!(response.challenge.is_empty());
        assert_eq!(response.algorithm, None);
    }

    #[test]
    fn test_list_names() {
        let payload = hex!("7204 21 616263 7200 7202 11 78");
        assert_eq!(list_names(&payload), vec![b"abc".to_vec(), b"x".to_vec()]);
    }

    #[test]
    fn test_merge_code() {
        let data = hex!("7101 61 7701 06  7101 62 7C01 06  7101 63 7605 06 00000001");
        let merged = merge_code(&data, b"b", &hex!("06 AABBCCDD")).unwrap();
        assert_eq!(
            merged,
            hex!("7101 61 7701 06  7101 62 7505 06AABBCCDD  7101 63 7605 06 00000001")
        );

        assert!(merge_code(&data, b"z", &hex!("06")).is_none());
        assert!(merge_code(&hex!("7101 61"), b"a", &hex!("06")).is_none());
    }
}
