mod otp;
mod token;
mod version;

use derive_more::Display;

use crate::constants::{ALG_MASK, TYPE_MASK};

pub use otp::{Code, OtpEntry, truncate};
pub use token::{Token, card_name};
pub use version::Version;

/// HMAC digest used for access keys and credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Display)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Algorithm {
    /// HMAC-SHA1, the applet default
    #[default]
    #[display("SHA1")]
    Sha1 = 0x01,
    /// HMAC-SHA256
    #[display("SHA256")]
    Sha256 = 0x02,
    /// HMAC-SHA512
    #[display("SHA512")]
    Sha512 = 0x03,
}

impl Algorithm {
    /// Every algorithm, in wire order
    pub const ALL: [Self; 3] = [Self::Sha1, Self::Sha256, Self::Sha512];

    /// Decode the algorithm bits of a type|algorithm byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte & ALG_MASK {
            0x01 => Some(Self::Sha1),
            0x02 => Some(Self::Sha256),
            0x03 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Wire value
    pub const fn to_byte(self) -> u8 {
        self as u8
    }

    /// Parse the name used in credential files
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.to_string() == name)
    }
}

/// OTP credential type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum TokenType {
    /// Counter based (RFC 4226)
    #[display("HOTP")]
    Hotp = 0x10,
    /// Time based (RFC 6238)
    #[display("TOTP")]
    Totp = 0x20,
}

impl TokenType {
    /// Decode the type bits of a type|algorithm byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte & TYPE_MASK {
            0x10 => Some(Self::Hotp),
            0x20 => Some(Self::Totp),
            _ => None,
        }
    }

    /// Wire value
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Result of the last authorization attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum AuthAccess {
    /// Not checked yet
    #[default]
    Unknown,
    /// The card has no access code
    Open,
    /// No key, or the key was not accepted
    Denied,
    /// The card accepted our key and proved it knows it too
    Granted,
}

impl AuthAccess {
    /// Whether credentials can be read
    pub const fn has_access(self) -> bool {
        matches!(self, Self::Open | Self::Granted)
    }
}

/// State of the session with one physical tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum TagState {
    /// No tag
    #[default]
    None,
    /// Tag present, applet not selected yet
    Checking,
    /// Not an ISO-DEP tag, or no OATH applet on it
    Unrecognized,
    /// The OATH applet answered SELECT
    Ready,
}

/// Summary state of a card as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum YubiKeyState {
    /// Nothing known yet
    #[default]
    Idle,
    /// Password needed
    Unauthorized,
    /// Credentials are readable
    Ready,
}

impl YubiKeyState {
    /// Next state after the card reported `access`
    ///
    /// The state never goes back to `Idle`. Once unauthorized, only a granted
    /// key makes the card ready again.
    pub const fn next(self, access: AuthAccess) -> Self {
        match (self, access) {
            (Self::Idle | Self::Ready, AuthAccess::Denied) => Self::Unauthorized,
            (Self::Idle, AuthAccess::Open | AuthAccess::Granted)
            | (Self::Unauthorized, AuthAccess::Granted) => Self::Ready,
            (state, _) => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_algorithm_byte() {
        assert_eq!(Algorithm::from_byte(0x21), Some(Algorithm::Sha1));
        assert_eq!(Algorithm::from_byte(0x12), Some(Algorithm::Sha256));
        assert_eq!(Algorithm::from_byte(0x03), Some(Algorithm::Sha512));
        assert_eq!(Algorithm::from_byte(0x24), None);
        assert_eq!(TokenType::from_byte(0x21), Some(TokenType::Totp));
        assert_eq!(TokenType::from_byte(0x12), Some(TokenType::Hotp));
        assert_eq!(TokenType::from_byte(0x02), None);
        assert_eq!(TokenType::Totp.to_byte() | Algorithm::Sha256.to_byte(), 0x22);
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(Algorithm::Sha256.to_string(), "SHA256");
        assert_eq!(Algorithm::from_name("SHA512"), Some(Algorithm::Sha512));
        assert_eq!(Algorithm::from_name("sha1"), None);
    }

    #[test]
    fn test_state_transitions() {
        let state = YubiKeyState::Idle;
        assert_eq!(state.next(AuthAccess::Unknown), YubiKeyState::Idle);
        let state = state.next(AuthAccess::Denied);
        assert_eq!(state, YubiKeyState::Unauthorized);
        let state = state.next(AuthAccess::Granted);
        assert_eq!(state, YubiKeyState::Ready);
        assert_eq!(state.next(AuthAccess::Unknown), YubiKeyState::Ready);
        assert_eq!(state.next(AuthAccess::Denied), YubiKeyState::Unauthorized);
        assert_eq!(YubiKeyState::Idle.next(AuthAccess::Open), YubiKeyState::Ready);
        assert_eq!(
            YubiKeyState::Unauthorized.next(AuthAccess::Open),
            YubiKeyState::Unauthorized
        );
    }
}
