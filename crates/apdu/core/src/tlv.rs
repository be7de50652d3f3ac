//! One-byte tag, one-byte length TLV records
//!
//! Card applets such as YKOATH frame every payload as a flat sequence of
//! `[tag:1][len:1][value:len]` records. Reading never fails: an exhausted
//! buffer, a length running past the end, or a zero tag all read as the end of
//! the data, and callers get whatever records preceded it.

use bytes::{BufMut, BytesMut};

/// A single record borrowed from a response buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// Tag byte, never zero
    pub tag: u8,
    /// Value bytes
    pub value: &'a [u8],
}

/// Read the next record from `buf`, advancing it past the record
///
/// Returns `None` and leaves `buf` untouched when no complete record is left.
pub fn read<'a>(buf: &mut &'a [u8]) -> Option<Tlv<'a>> {
    let data = *buf;
    if data.len() < 2 {
        return None;
    }
    let tag = data[0];
    let len = data[1] as usize;
    if tag == 0 || data.len() < 2 + len {
        return None;
    }
    *buf = &data[2 + len..];
    Some(Tlv {
        tag,
        value: &data[2..2 + len],
    })
}

/// Iterate over the records of `buf` until the end of the readable data
pub const fn iter(buf: &[u8]) -> TlvIter<'_> {
    TlvIter { buf }
}

/// Find the value of the first record with `tag`
pub fn find(buf: &[u8], tag: u8) -> Option<&[u8]> {
    iter(buf).find(|tlv| tlv.tag == tag).map(|tlv| tlv.value)
}

/// Append a record to `out`
///
/// # Panics
///
/// Panics if `value` is longer than 255 bytes. Record lengths are a single
/// byte, so a longer value is a programming error on the caller's side.
pub fn append(out: &mut BytesMut, tag: u8, value: &[u8]) {
    assert!(value.len() <= 0xFF, "TLV value too long: {} bytes", value.len());
    out.reserve(2 + value.len());
    out.put_u8(tag);
    out.put_u8(value.len() as u8);
    out.put_slice(value);
}

/// Iterator over TLV records, see [`iter`]
#[derive(Debug, Clone)]
pub struct TlvIter<'a> {
    buf: &'a [u8],
}

impl<'a> TlvIter<'a> {
    /// Bytes not consumed so far
    pub const fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        read(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_read_leaves_rest() {
        let mut out = BytesMut::new();
        append(&mut out, 0x71, b"name");
        out.put_slice(&hex!("CAFE"));

        let mut buf = &out[..];
        let tlv = read(&mut buf).unwrap();
        assert_eq!(tlv.tag, 0x71);
        assert_eq!(tlv.value, b"name");
        assert_eq!(buf, hex!("CAFE"));
    }

    #[test]
    fn test_append_limits() {
        let mut out = BytesMut::new();
        append(&mut out, 0x74, &[]);
        append(&mut out, 0x75, &[0xAB; 255]);
        assert_eq!(out.len(), 2 + 2 + 255);
        assert_eq!(&out[..4], hex!("740075FF"));

        let mut buf = &out[..];
        assert_eq!(read(&mut buf).unwrap().value, &[] as &[u8]);
        assert_eq!(read(&mut buf).unwrap().value.len(), 255);
        assert!(read(&mut buf).is_none());
    }

    #[test]
    #[should_panic]
    fn test_append_too_long() {
        let mut out = BytesMut::new();
        append(&mut out, 0x75, &[0; 256]);
    }

    #[test]
    fn test_malformed_reads_as_end() {
        // Length overflows the buffer
        let data = hex!("7105616263");
        let mut buf = &data[..];
        assert!(read(&mut buf).is_none());
        assert_eq!(buf.len(), data.len());

        // Single stray byte
        let stray = hex!("71");
        let mut buf = &stray[..];
        assert!(read(&mut buf).is_none());

        // Zero tag terminates
        let data = hex!("7101610000");
        let tags: Vec<u8> = iter(&data).map(|t| t.tag).collect();
        assert_eq!(tags, vec![0x71]);
    }

    #[test]
    fn test_iter_and_find() {
        let data = hex!("7903040201 7103AABBCC 7408 0102030405060708 7B01 01");
        let tags: Vec<u8> = iter(&data).map(|t| t.tag).collect();
        assert_eq!(tags, vec![0x79, 0x71, 0x74, 0x7B]);
        assert_eq!(find(&data, 0x71), Some(&hex!("AABBCC")[..]));
        assert_eq!(find(&data, 0x75), None);

        let mut it = iter(&data);
        it.next();
        assert_eq!(it.remaining().len(), data.len() - 5);
    }
}
