use std::fmt;

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{ACCESS_KEY_SIZE, CHALLENGE_SIZE, PBKDF2_ITERATIONS};
use crate::{Algorithm, Error, Result};

/// Host or card challenge
pub type Challenge = [u8; CHALLENGE_SIZE];

/// Secret shared between the host and one card, for one algorithm
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AccessKey([u8; ACCESS_KEY_SIZE]);

impl AccessKey {
    /// Wrap raw key bytes
    pub const fn new(bytes: [u8; ACCESS_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Key from a slice of exactly [`ACCESS_KEY_SIZE`] bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Raw key bytes
    pub const fn as_bytes(&self) -> &[u8; ACCESS_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessKey(..)")
    }
}

/// Derive the access key for `card_id` from a password
///
/// PBKDF2 with the HMAC digest of `algorithm`, the card id as salt and
/// [`PBKDF2_ITERATIONS`] rounds.
pub fn derive_key(card_id: &[u8], algorithm: Algorithm, password: &str) -> AccessKey {
    let mut key = [0u8; ACCESS_KEY_SIZE];
    let password = password.as_bytes();
    match algorithm {
        Algorithm::Sha1 => pbkdf2_hmac::<Sha1>(password, card_id, PBKDF2_ITERATIONS, &mut key),
        Algorithm::Sha256 => pbkdf2_hmac::<Sha256>(password, card_id, PBKDF2_ITERATIONS, &mut key),
        Algorithm::Sha512 => pbkdf2_hmac::<Sha512>(password, card_id, PBKDF2_ITERATIONS, &mut key),
    }
    AccessKey(key)
}

/// HMAC of `data` with the digest of `algorithm`
pub fn hmac(algorithm: Algorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        Algorithm::Sha1 => mac::<Hmac<Sha1>>(key, data),
        Algorithm::Sha256 => mac::<Hmac<Sha256>>(key, data),
        Algorithm::Sha512 => mac::<Hmac<Sha512>>(key, data),
    }
}

fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| Error::InvalidKeyLength)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Response to a card or host challenge
pub fn compute_response(key: &AccessKey, algorithm: Algorithm, challenge: &[u8]) -> Result<Vec<u8>> {
    hmac(algorithm, key.as_bytes(), challenge)
}

/// Fresh random challenge
pub fn random_challenge() -> Challenge {
    let mut challenge = Challenge::default();
    rand::rng().fill_bytes(&mut challenge);
    challenge
}

/// Random access key
pub fn random_key() -> AccessKey {
    let mut key = [0u8; ACCESS_KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    AccessKey(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_derive_key_deterministic() {
        let card_id = hex!("AABBCC");
        let a = derive_key(&card_id, Algorithm::Sha1, "pw");
        let b = derive_key(&card_id, Algorithm::Sha1, "pw");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), ACCESS_KEY_SIZE);

        assert_ne!(a, derive_key(&hex!("AABBCD"), Algorithm::Sha1, "pw"));
        assert_ne!(a, derive_key(&card_id, Algorithm::Sha256, "pw"));
        assert_ne!(a, derive_key(&card_id, Algorithm::Sha1, "pw2"));
    }

    #[test]
    fn test_hmac_rfc2202() {
        // RFC 2202 test case 2
        let mac = hmac(Algorithm::Sha1, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(mac, hex!("effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"));
    }

    #[test]
    fn test_hmac_rfc4226_counter() {
        let mac = hmac(
            Algorithm::Sha1,
            b"12345678901234567890",
            &1u64.to_be_bytes(),
        )
        .unwrap();
        assert_eq!(
            crate::truncate(&mac).map(|v| v % 1_000_000),
            Some(287_082)
        );
    }

    #[test]
    fn test_response_lengths() {
        let key = random_key();
        let challenge = random_challenge();
        assert_eq!(compute_response(&key, Algorithm::Sha1, &challenge).unwrap().len(), 20);
        assert_eq!(compute_response(&key, Algorithm::Sha256, &challenge).unwrap().len(), 32);
        assert_eq!(compute_response(&key, Algorithm::Sha512, &challenge).unwrap().len(), 64);
        assert_eq!(format!("{key:?}"), "AccessKey(..)");
    }
}
