use std::fmt;

use zeroize::Zeroizing;

use super::{Algorithm, TokenType};
use crate::constants::{
    DEFAULT_DIGITS, MAX_DIGITS, MAX_KEY_SIZE, MAX_NAME_LEN, MAX_PAYLOAD, MIN_DIGITS,
    MIN_KEY_SIZE,
};
use crate::{Error, Result};

/// An OTP credential to store on a card
#[derive(Clone)]
pub struct Token {
    /// HOTP or TOTP
    pub token_type: TokenType,
    /// HMAC digest
    pub algorithm: Algorithm,
    /// Account label
    pub label: String,
    /// Issuer, may be empty
    pub issuer: String,
    /// Shared secret
    pub secret: Zeroizing<Vec<u8>>,
    /// Code length
    pub digits: u8,
    /// Initial HOTP counter, ignored for TOTP
    pub counter: u32,
    /// Whether the card should only calculate after a touch
    pub require_touch: bool,
}

impl Token {
    /// Create a credential with default settings
    pub fn new(
        token_type: TokenType,
        label: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            token_type,
            algorithm: Algorithm::default(),
            label: label.into(),
            issuer: String::new(),
            secret: Zeroizing::new(secret.into()),
            digits: DEFAULT_DIGITS,
            counter: 0,
            require_touch: false,
        }
    }

    /// Time based credential
    pub fn totp(label: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self::new(TokenType::Totp, label, secret)
    }

    /// Counter based credential
    pub fn hotp(label: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self::new(TokenType::Hotp, label, secret)
    }

    /// Set the issuer
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Set the HMAC digest
    pub const fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the code length
    pub const fn with_digits(mut self, digits: u8) -> Self {
        self.digits = digits;
        self
    }

    /// Set the initial HOTP counter
    pub const fn with_counter(mut self, counter: u32) -> Self {
        self.counter = counter;
        self
    }

    /// Require a touch before each calculation
    pub const fn with_touch(mut self, require_touch: bool) -> Self {
        self.require_touch = require_touch;
        self
    }

    /// Name stored on the card: `issuer:label`, or the bare label
    ///
    /// Cut to [`MAX_NAME_LEN`] bytes without splitting a character.
    pub fn name(&self) -> String {
        if self.issuer.is_empty() {
            card_name(&self.label).to_owned()
        } else {
            card_name(&format!("{}:{}", self.issuer, self.label)).to_owned()
        }
    }

    /// Check the fields the applet would reject
    pub fn validate(&self) -> Result<()> {
        if !(MIN_DIGITS..=MAX_DIGITS).contains(&self.digits) {
            return Err(Error::InvalidDigits(self.digits));
        }
        if self.label.is_empty() {
            return Err(Error::InvalidToken("empty label"));
        }
        if self.secret.is_empty() {
            return Err(Error::InvalidToken("empty secret"));
        }
        if self.secret.len() > MAX_KEY_SIZE {
            return Err(Error::InvalidToken("secret too long"));
        }
        if self.put_size() > MAX_PAYLOAD {
            return Err(Error::InvalidToken("credential too large"));
        }
        Ok(())
    }

    /// Size of the PUT body: name and key records, then the optional
    /// property and counter records
    fn put_size(&self) -> usize {
        let mut size = 2 + self.name().len() + 4 + self.secret.len().max(MIN_KEY_SIZE);
        if self.require_touch {
            size += 2;
        }
        if self.token_type == TokenType::Hotp {
            size += 6;
        }
        size
    }
}

/// Longest prefix of `name` the applet stores, cut on a character boundary
pub fn card_name(name: &str) -> &str {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token_type", &self.token_type)
            .field("algorithm", &self.algorithm)
            .field("label", &self.label)
            .field("issuer", &self.issuer)
            .field("digits", &self.digits)
            .field("counter", &self.counter)
            .field("require_touch", &self.require_touch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_with_issuer() {
        let token = Token::totp("alice", b"secret".to_vec());
        assert_eq!(token.name(), "alice");
        assert_eq!(token.with_issuer("Example").name(), "Example:alice");
    }

    #[test]
    fn test_name_truncated_on_char_boundary() {
        // 63 ASCII bytes followed by a two byte character
        let label = format!("{}é", "a".repeat(63));
        let token = Token::totp(label, b"secret".to_vec());
        assert_eq!(token.name(), "a".repeat(63));

        let token = Token::totp("b".repeat(70), b"secret".to_vec());
        assert_eq!(token.name().len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_validate() {
        let token = Token::hotp("bob", b"12345678901234567890".to_vec());
        assert!(token.validate().is_ok());
        assert!(matches!(
            token.clone().with_digits(9).validate(),
            Err(Error::InvalidDigits(9))
        ));
        assert!(token.clone().with_digits(5).validate().is_err());
        assert!(Token::hotp("bob", Vec::new()).validate().is_err());
        assert!(matches!(
            Token::hotp("bob", vec![1; 300]).validate(),
            Err(Error::InvalidToken("secret too long"))
        ));
        // 5 + 4 + 240 + 6 bytes is a full short APDU body
        assert!(Token::hotp("bob", vec![1; 240]).validate().is_ok());
        assert!(matches!(
            Token::hotp("bob", vec![1; 240]).with_touch(true).validate(),
            Err(Error::InvalidToken("credential too large"))
        ));
        assert!(!format!("{token:?}").contains("secret:"));
    }
}
