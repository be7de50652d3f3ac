//! Status word definitions for APDU responses

use std::fmt;

use tracing::Level;

/// Status Word (SW1-SW2) from an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Create from a u16 value (SW1 | SW2)
    pub const fn from_u16(status: u16) -> Self {
        Self {
            sw1: (status >> 8) as u8,
            sw2: status as u8,
        }
    }

    /// Convert to a u16 value (SW1 | SW2)
    pub const fn to_u16(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Check if this status word indicates success (90 00)
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Check if this status word indicates more data is available (61 XX)
    pub const fn is_more_data_available(&self) -> bool {
        self.sw1 == 0x61
    }

    /// Number of bytes the card claims are still pending when SW1 = 61
    ///
    /// A zero SW2 stands for 256. The value is a hint only, cards are free to
    /// return a different amount.
    pub const fn remaining_bytes(&self) -> Option<usize> {
        if self.sw1 == 0x61 {
            Some(if self.sw2 == 0 { 0x100 } else { self.sw2 as usize })
        } else {
            None
        }
    }

    /// Authentication is not enabled, or there is no such object (69 84)
    pub const fn is_auth_not_enabled(&self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x84
    }

    /// Wrong syntax in the command data (6A 80)
    ///
    /// VALIDATE answers this to a response computed with the wrong key.
    pub const fn is_wrong_syntax(&self) -> bool {
        self.sw1 == 0x6A && self.sw2 == 0x80
    }

    /// Generic error (65 81)
    pub const fn is_generic_error(&self) -> bool {
        self.sw1 == 0x65 && self.sw2 == 0x81
    }

    /// Another application got selected concurrently (68 83)
    pub const fn is_select_conflict(&self) -> bool {
        self.sw1 == 0x68 && self.sw2 == 0x83
    }

    /// Get the appropriate tracing level for this status word
    pub const fn tracing_level(&self) -> Level {
        if self.is_success() || self.is_more_data_available() {
            Level::DEBUG
        } else if self.is_auth_not_enabled() || self.sw1 == 0x62 || self.sw1 == 0x63 {
            Level::INFO
        } else {
            Level::WARN
        }
    }

    /// Get a description of this status word
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            (0x62, 0x00) => "No information given",
            (0x63, 0x00) => "No information given",
            (0x65, 0x81) => "Generic error",
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x83) => "Last command of the chain expected",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x84) => "Authentication not enabled or no such object",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x86) => "Command not allowed",
            (0x6A, 0x80) => "Wrong syntax",
            (0x6A, 0x81) => "Function not supported",
            (0x6A, 0x82) => "File not found",
            (0x6A, 0x84) => "Not enough memory space",
            (0x6A, 0x86) => "Incorrect parameters P1-P2",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status word",
        }
    }
}

impl From<(u8, u8)> for StatusWord {
    fn from(tuple: (u8, u8)) -> Self {
        Self::new(tuple.0, tuple.1)
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}

/// Common status words
pub mod common {
    use super::StatusWord;

    /// Success (90 00)
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);

    /// More data available (61 XX) - XX is the number of remaining bytes
    pub const MORE_DATA: StatusWord = StatusWord::new(0x61, 0x00);

    /// Authentication not enabled / no such object (69 84)
    pub const AUTH_NOT_ENABLED: StatusWord = StatusWord::new(0x69, 0x84);

    /// Wrong syntax (6A 80)
    pub const WRONG_SYNTAX: StatusWord = StatusWord::new(0x6A, 0x80);

    /// Generic error (65 81)
    pub const GENERIC_ERROR: StatusWord = StatusWord::new(0x65, 0x81);

    /// Concurrent SELECT of another application (68 83)
    pub const SELECT_CONFLICT: StatusWord = StatusWord::new(0x68, 0x83);

    /// Not enough memory space (6A 84)
    pub const NO_SPACE: StatusWord = StatusWord::new(0x6A, 0x84);

    /// Instruction not supported (6D 00)
    pub const INVALID_INSTRUCTION: StatusWord = StatusWord::new(0x6D, 0x00);

    /// File (application) not found (6A 82)
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_word_from_to_u16() {
        let sw = StatusWord::from_u16(0x9000);
        assert_eq!(sw.sw1, 0x90);
        assert_eq!(sw.sw2, 0x00);
        assert_eq!(sw.to_u16(), 0x9000);
        assert_eq!(StatusWord::from(0x6A80), common::WRONG_SYNTAX);
    }

    #[test]
    fn test_status_word_is_methods() {
        assert!(StatusWord::new(0x90, 0x00).is_success());
        assert!(StatusWord::new(0x61, 0x10).is_more_data_available());
        assert!(StatusWord::new(0x69, 0x84).is_auth_not_enabled());
        assert!(StatusWord::new(0x6A, 0x80).is_wrong_syntax());
        assert!(StatusWord::new(0x65, 0x81).is_generic_error());
        assert!(StatusWord::new(0x68, 0x83).is_select_conflict());
        assert!(!StatusWord::new(0x90, 0x00).is_more_data_available());
    }

    #[test]
    fn test_status_word_remaining_bytes() {
        assert_eq!(StatusWord::new(0x61, 0x42).remaining_bytes(), Some(0x42));
        assert_eq!(StatusWord::new(0x61, 0x00).remaining_bytes(), Some(256));
        assert_eq!(StatusWord::new(0x90, 0x00).remaining_bytes(), None);
    }

    #[test]
    fn test_status_word_description() {
        assert_eq!(StatusWord::new(0x90, 0x00).description(), "Success");
        assert_eq!(
            StatusWord::new(0x61, 0x15).description(),
            "More data available"
        );
        assert_eq!(StatusWord::new(0x6A, 0x80).description(), "Wrong syntax");
        assert_eq!(StatusWord::new(0x12, 0x34).description(), "Unknown status word");
    }

    #[test]
    fn test_tracing_level() {
        assert_eq!(common::SUCCESS.tracing_level(), Level::DEBUG);
        assert_eq!(common::AUTH_NOT_ENABLED.tracing_level(), Level::INFO);
        assert_eq!(common::WRONG_SYNTAX.tracing_level(), Level::WARN);
    }
}
