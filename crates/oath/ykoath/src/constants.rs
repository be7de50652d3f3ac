use std::time::Duration;

/// OATH applet AID
pub const OATH_AID: &[u8] = b"\xA0\x00\x00\x05\x27\x21\x01";

/// Instruction bytes of the OATH applet
pub mod ins {
    /// Store a credential
    pub const PUT: u8 = 0x01;
    /// Remove a credential
    pub const DELETE: u8 = 0x02;
    /// Set or remove the access code
    pub const SET_CODE: u8 = 0x03;
    /// Factory reset, P1 P2 must be `DE AD`
    pub const RESET: u8 = 0x04;
    /// List credentials
    pub const LIST: u8 = 0xA1;
    /// Calculate one code
    pub const CALCULATE: u8 = 0xA2;
    /// Authenticate with the access key
    pub const VALIDATE: u8 = 0xA3;
    /// Calculate all codes. Shares the INS byte with SELECT, P1 tells them apart.
    pub const CALCULATE_ALL: u8 = 0xA4;
    /// Select by AID
    pub const SELECT: u8 = 0xA4;
    /// Fetch the rest of a chained response
    pub const SEND_REMAINING: u8 = 0xA5;
}

/// TLV tags
pub mod tags {
    /// Credential name (UTF-8), or card id in the SELECT response
    pub const NAME: u8 = 0x71;
    /// LIST entry: type|algorithm byte followed by the name
    pub const NAME_LIST: u8 = 0x72;
    /// Key: type|algorithm byte, digits, secret
    pub const KEY: u8 = 0x73;
    /// Challenge
    pub const CHALLENGE: u8 = 0x74;
    /// Full HMAC response, prefixed with the digit count
    pub const RESPONSE_FULL: u8 = 0x75;
    /// Truncated response: digit count and 4 bytes
    pub const RESPONSE_TRUNCATED: u8 = 0x76;
    /// HOTP credential, not calculated
    pub const NO_RESPONSE: u8 = 0x77;
    /// Credential property byte
    pub const PROPERTY: u8 = 0x78;
    /// Firmware version
    pub const VERSION: u8 = 0x79;
    /// Initial moving factor (HOTP counter)
    pub const IMF: u8 = 0x7A;
    /// Access key algorithm
    pub const ALGORITHM: u8 = 0x7B;
    /// Credential requires touch, not calculated
    pub const RESPONSE_TOUCH: u8 = 0x7C;
}

/// Algorithm bits of a type|algorithm byte
pub const ALG_MASK: u8 = 0x0F;
/// Type bits of a type|algorithm byte
pub const TYPE_MASK: u8 = 0xF0;

/// Property bit: the credential only calculates after a touch
pub const PROP_REQUIRE_TOUCH: u8 = 0x02;

/// TOTP time step
pub const DEFAULT_TOTP_PERIOD: Duration = Duration::from_secs(30);

/// Size of a derived access key
pub const ACCESS_KEY_SIZE: usize = 16;
/// Size of VALIDATE and SET_CODE challenges
pub const CHALLENGE_SIZE: usize = 8;
/// PBKDF2 rounds used to derive access keys
pub const PBKDF2_ITERATIONS: u32 = 1000;

/// Longest credential name the applet stores, in bytes
pub const MAX_NAME_LEN: usize = 64;
/// Shorter secrets are zero-padded, the applet rejects them otherwise
pub const MIN_KEY_SIZE: usize = 14;
/// Longest secret that fits a KEY record next to its type and digits bytes
pub const MAX_KEY_SIZE: usize = 0xFF - 2;
/// Largest command body of a short APDU
pub const MAX_PAYLOAD: usize = 0xFF;

/// Digits of a code when not specified
pub const DEFAULT_DIGITS: u8 = 6;
/// Fewest digits the applet accepts
pub const MIN_DIGITS: u8 = 6;
/// Most digits the applet accepts
pub const MAX_DIGITS: u8 = 8;
