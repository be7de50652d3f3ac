//! Reader representation for PC/SC devices

use pcsc::{ReaderState, State};

/// RID of the PC/SC part 3 ATR synthesized for contactless storage cards
/// (MIFARE Classic, Ultralight and similar), which do not speak ISO-DEP
const STORAGE_CARD_RID: [u8; 8] = [0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06];

/// Representation of a PC/SC card reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcscReader {
    /// Name of the reader
    name: String,

    /// Whether a card is present
    has_card: bool,

    /// Answer To Reset of the card (if present)
    atr: Option<Vec<u8>>,
}

impl PcscReader {
    /// Create a new reader
    pub const fn new(name: String, has_card: bool, atr: Option<Vec<u8>>) -> Self {
        Self {
            name,
            has_card,
            atr,
        }
    }

    /// Get the reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if a card is present in the reader
    pub const fn has_card(&self) -> bool {
        self.has_card
    }

    /// Get the ATR of the card if present
    pub fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }

    /// Whether the present card can carry APDUs
    pub fn is_iso_dep(&self) -> bool {
        self.has_card && self.atr().is_some_and(is_iso_dep_atr)
    }

    /// Create a reader from a reader state
    pub(crate) fn from_reader_state(reader_state: &ReaderState) -> Self {
        let has_card = card_present(reader_state.event_state());

        let atr = if has_card {
            Some(reader_state.atr().to_vec())
        } else {
            None
        };

        Self {
            name: reader_state.name().to_string_lossy().into_owned(),
            has_card,
            atr,
        }
    }
}

pub(crate) fn card_present(state: State) -> bool {
    state.contains(State::PRESENT) && !state.contains(State::EMPTY)
}

/// Classify an ATR as ISO-DEP capable
///
/// Readers following PC/SC part 3 report storage cards with a synthesized ATR
/// whose historical bytes start with the storage-card RID.
pub fn is_iso_dep_atr(atr: &[u8]) -> bool {
    !atr.windows(STORAGE_CARD_RID.len())
        .any(|window| window == STORAGE_CARD_RID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_storage_card_is_not_iso_dep() {
        // MIFARE Classic 1K on an ACR122U
        let mifare = hex!("3B8F8001804F0CA000000306030001000000006A");
        assert!(!is_iso_dep_atr(&mifare));

        // YubiKey 5 NFC
        let yubikey = hex!("3B8D80018073C021C057597562694B65797F");
        assert!(is_iso_dep_atr(&yubikey));
    }

    #[test]
    fn test_reader_iso_dep() {
        let reader = PcscReader::new(
            "ACS ACR122U".into(),
            true,
            Some(hex!("3B8D80018073C021C057597562694B65797F").to_vec()),
        );
        assert!(reader.is_iso_dep());

        let empty = PcscReader::new("ACS ACR122U".into(), false, None);
        assert!(!empty.is_iso_dep());
        assert_eq!(empty.atr(), None);
    }
}
