//! APDU command definitions
//!
//! Short (single byte Lc/Le) ISO/IEC 7816-4 commands. Card applets reached
//! over ISO-DEP never need extended lengths, payloads are capped at 255 bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length (optional)
    pub le: Option<u8>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Set the data field
    ///
    /// An empty payload is dropped, the command is then sent without Lc.
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        let data = data.into();
        self.data = (!data.is_empty()).then_some(data);
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Command payload data, empty when absent
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Calculate length of serialized command
    pub fn command_length(&self) -> usize {
        4 + self.data.as_ref().map_or(0, |d| 1 + d.len()) + usize::from(self.le.is_some())
    }

    /// Convert to raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.command_length());

        // Header: CLA, INS, P1, P2
        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        if let Some(data) = &self.data {
            debug_assert!(data.len() <= 255, "short APDU payload overflow");
            buffer.put_u8(data.len() as u8);
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            buffer.put_u8(le);
        }

        buffer.freeze()
    }

    /// Parse a command from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::InvalidCommandLength(data.len()));
        }

        let mut command = Self::new(data[0], data[1], data[2], data[3]);

        if data.len() == 5 {
            command.le = Some(data[4]);
        } else if data.len() > 5 {
            let lc = data[4] as usize;
            let end = 5 + lc;
            if data.len() < end || data.len() > end + 1 {
                return Err(Error::InvalidCommandLength(data.len()));
            }
            command.data = Some(Bytes::copy_from_slice(&data[5..end]));
            command.le = data.get(end).copied();
        }

        Ok(command)
    }

    /// Check whether this command has the same header as `other`
    pub const fn matches_header(&self, other: &Self) -> bool {
        self.cla == other.cla && self.ins == other.ins && self.p1 == other.p1 && self.p2 == other.p2
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:02X} {:02X}",
            self.cla, self.ins, self.p1, self.p2
        )?;
        if let Some(data) = &self.data {
            write!(f, " [{}]", hex::encode(data))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_command_serialization() {
        let cmd = Command::new_with_data(0x00, 0xA4, 0x04, 0x00, hex!("A0000005272101").to_vec());
        assert_eq!(cmd.to_bytes().as_ref(), hex!("00A4040007A0000005272101"));
        assert_eq!(cmd.command_length(), 12);

        let cmd = Command::new(0x00, 0xA5, 0x00, 0x00);
        assert_eq!(cmd.to_bytes().as_ref(), hex!("00A50000"));
    }

    #[test]
    fn test_empty_data_is_dropped() {
        let cmd = Command::new(0x00, 0xA1, 0x00, 0x00).with_data(Bytes::new());
        assert!(cmd.data.is_none());
        assert_eq!(cmd.to_bytes().as_ref(), hex!("00A10000"));
    }

    #[test]
    fn test_command_from_bytes() {
        let cmd = Command::from_bytes(&hex!("00A40400")).unwrap();
        assert!(cmd.data.is_none());
        assert!(cmd.le.is_none());

        let cmd = Command::from_bytes(&hex!("0002000003710161")).unwrap();
        assert_eq!(cmd.ins, 0x02);
        assert_eq!(cmd.data(), &hex!("710161"));
        assert!(cmd.le.is_none());

        let cmd = Command::from_bytes(&hex!("00A2000003710161FF")).unwrap();
        assert_eq!(cmd.le, Some(0xFF));

        let cmd = Command::from_bytes(&hex!("00A1000000")).unwrap();
        assert_eq!(cmd.le, Some(0));

        assert!(Command::from_bytes(&hex!("00A1")).is_err());
        assert!(Command::from_bytes(&hex!("00A200000571")).is_err());
    }

    #[test]
    fn test_display() {
        let cmd = Command::new_with_data(0x00, 0x02, 0x00, 0x00, hex!("710161").to_vec());
        assert_eq!(cmd.to_string(), "00 02 00 00 [710161]");
    }
}
