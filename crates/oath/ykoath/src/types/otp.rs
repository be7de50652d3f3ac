use ykoath_apdu_core::tlv;

use super::{Algorithm, TokenType};
use crate::constants::{DEFAULT_DIGITS, tags};

/// What the card returned for one credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Full HMAC response, dynamically truncated
    Full(u32),
    /// Truncated response
    Truncated(u32),
    /// HOTP credential, calculate it explicitly
    NoResponse,
    /// The credential needs a touch, calculate it explicitly
    RequiresTouch,
}

impl Code {
    /// Decode a response record, returning the digit count with the code
    pub fn from_record(tag: u8, value: &[u8]) -> Option<(u8, Self)> {
        let (&digits, rest) = value.split_first()?;
        let code = match tag {
            tags::RESPONSE_FULL => Self::Full(truncate(rest)?),
            tags::RESPONSE_TRUNCATED => {
                let bytes: [u8; 4] = rest.try_into().ok()?;
                Self::Truncated(u32::from_be_bytes(bytes) & 0x7FFF_FFFF)
            }
            tags::NO_RESPONSE => Self::NoResponse,
            tags::RESPONSE_TOUCH => Self::RequiresTouch,
            _ => return None,
        };
        Some((digits, code))
    }

    /// The 31-bit value, if one was calculated
    pub const fn value(&self) -> Option<u32> {
        match self {
            Self::Full(value) | Self::Truncated(value) => Some(*value),
            Self::NoResponse | Self::RequiresTouch => None,
        }
    }

    /// Whether the code must be calculated with an explicit request
    pub const fn needs_refresh(&self) -> bool {
        matches!(self, Self::NoResponse | Self::RequiresTouch)
    }

    /// The code as shown to the user, `digits` long
    ///
    /// `None` when nothing was calculated or the card reports a digit count
    /// no code can have.
    pub fn display(&self, digits: u8) -> Option<String> {
        let value = self.value()?;
        let modulus = 10u64.checked_pow(u32::from(digits))?;
        Some(format!(
            "{:0width$}",
            u64::from(value) % modulus,
            width = usize::from(digits)
        ))
    }
}

/// Dynamic truncation of an HMAC (RFC 4226 section 5.3)
pub fn truncate(hmac: &[u8]) -> Option<u32> {
    let offset = usize::from(hmac.last()? & 0x0F);
    let bytes: [u8; 4] = hmac.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) & 0x7FFF_FFFF)
}

/// One credential joined from a LIST and a CALCULATE ALL response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpEntry {
    /// Credential name
    pub name: String,
    /// HOTP or TOTP, `None` for types this crate doesn't know
    pub token_type: Option<TokenType>,
    /// HMAC digest
    pub algorithm: Option<Algorithm>,
    /// Code length
    pub digits: u8,
    /// Calculated code, `None` when the credential is missing from the data
    pub code: Option<Code>,
}

impl OtpEntry {
    /// Join raw LIST and CALCULATE ALL payloads, in list order
    pub fn collect(otp_list: &[u8], otp_data: &[u8]) -> Vec<Self> {
        let mut entries: Vec<Self> = tlv::iter(otp_list)
            .filter(|record| record.tag == tags::NAME_LIST)
            .filter_map(|record| {
                let (&type_alg, name) = record.value.split_first()?;
                Some(Self {
                    name: String::from_utf8_lossy(name).into_owned(),
                    token_type: TokenType::from_byte(type_alg),
                    algorithm: Algorithm::from_byte(type_alg),
                    digits: DEFAULT_DIGITS,
                    code: None,
                })
            })
            .collect();

        let mut current: Option<usize> = None;
        for record in tlv::iter(otp_data) {
            if record.tag == tags::NAME {
                let name = String::from_utf8_lossy(record.value);
                current = entries
                    .iter()
                    .position(|entry| entry.code.is_none() && entry.name == name);
                continue;
            }
            let Some(index) = current.take() else {
                continue;
            };
            if let Some((digits, code)) = Code::from_record(record.tag, record.value) {
                entries[index].digits = digits;
                entries[index].code = Some(code);
            }
        }
        entries
    }

    /// The code as shown to the user
    pub fn display_code(&self) -> Option<String> {
        self.code.and_then(|code| code.display(self.digits))
    }

    /// Whether the code is only available on explicit request
    pub fn is_refreshable(&self) -> bool {
        self.token_type == Some(TokenType::Hotp) || self.code.is_some_and(|c| c.needs_refresh())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // RFC 4226 appendix D, HMAC-SHA1 of counter 1
    const RFC4226_COUNT1: [u8; 20] = hex!("75a48a19d4cbe100644e8ac1397eea747a2d33ab");

    #[test]
    fn test_rfc4226_truncation() {
        let value = truncate(&RFC4226_COUNT1).unwrap();
        assert_eq!(Code::Full(value).display(6).unwrap(), "287082");

        let mut record = vec![6];
        record.extend_from_slice(&RFC4226_COUNT1);
        let (digits, code) = Code::from_record(tags::RESPONSE_FULL, &record).unwrap();
        assert_eq!(digits, 6);
        assert_eq!(code.display(digits).unwrap(), "287082");
    }

    #[test]
    fn test_truncated_record_masks_sign_bit() {
        let (digits, code) =
            Code::from_record(tags::RESPONSE_TRUNCATED, &hex!("08 FFFFFFFF")).unwrap();
        assert_eq!(digits, 8);
        assert_eq!(code, Code::Truncated(0x7FFF_FFFF));
        assert_eq!(code.display(8).unwrap(), "47483647");
        assert!(Code::from_record(tags::RESPONSE_TRUNCATED, &hex!("06 0102")).is_none());
    }

    #[test]
    fn test_short_codes_are_padded() {
        assert_eq!(Code::Truncated(42).display(6).unwrap(), "000042");
        assert_eq!(Code::NoResponse.display(6), None);
    }

    #[test]
    fn test_display_with_bogus_digits() {
        // Digit counts come from the card
        assert_eq!(Code::Full(123).display(20), None);
        assert_eq!(Code::Truncated(123).display(u8::MAX), None);
        assert_eq!(Code::Full(123).display(19).unwrap(), format!("{:019}", 123));

        let entries = OtpEntry::collect(&hex!("7202 21 61"), &hex!("7101 61 7605 FF 0000002A"));
        assert_eq!(entries[0].digits, 0xFF);
        assert_eq!(entries[0].display_code(), None);
    }

    #[test]
    fn test_collect() {
        let list = hex!("7204 21 616263  7202 11 78  7203 22 7A7A");
        let data = hex!(
            "7103 616263  7605 06 0000002A"
            "7101 78      7701 06"
            "7102 7A7A    7C01 08"
        );
        let entries = OtpEntry::collect(&list, &data);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "abc");
        assert_eq!(entries[0].token_type, Some(TokenType::Totp));
        assert_eq!(entries[0].algorithm, Some(Algorithm::Sha1));
        assert_eq!(entries[0].display_code().as_deref(), Some("000042"));
        assert!(!entries[0].is_refreshable());

        assert_eq!(entries[1].name, "x");
        assert_eq!(entries[1].token_type, Some(TokenType::Hotp));
        assert_eq!(entries[1].code, Some(Code::NoResponse));
        assert!(entries[1].is_refreshable());

        assert_eq!(entries[2].algorithm, Some(Algorithm::Sha256));
        assert_eq!(entries[2].digits, 8);
        assert_eq!(entries[2].code, Some(Code::RequiresTouch));
        assert!(entries[2].is_refreshable());
    }

    #[test]
    fn test_collect_without_data() {
        let list = hex!("7202 21 61");
        let entries = OtpEntry::collect(&list, &[]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].code, None);
        assert_eq!(entries[0].display_code(), None);
    }
}
