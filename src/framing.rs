//! The wire framing codec.
//!
//! One record is a self-delimited `(message-id, payload)` pair, laid out
//! little-endian:
//!
//! ```text
//! offset 0            : u64 total_len  // includes these 8 bytes
//! offset 8            : u8  id_len     // = 1 + len(id)
//! offset 9            : [u8] id        // id_len - 1 bytes
//! offset 9 + len(id)  : [u8] payload
//! ```
//!
//! Kept as a pure function pair (no sockets, no buffers) so it can be
//! property-tested in isolation, per the teacher's
//! `communication::message::Header::{serialize_into, deserialize_from}`
//! shape.

use crate::error::{Error, ErrorKind, Result};

/// Length of the fixed prefix: 8 bytes of `total_len` + 1 byte of `id_len`.
pub const PREFIX_LEN: usize = 9;

/// Largest id that can be represented: `id_len` is a `u8` and must leave
/// room for its own "includes itself" bit, so the raw id is at most 254
/// bytes.
pub const MAX_ID_LEN: usize = u8::MAX as usize - 1;

/// Encodes `(id, payload)` into one contiguous, self-delimited record.
///
/// # Panics
/// Panics if `id.len() > MAX_ID_LEN`; callers are expected to validate
/// ids before reaching this layer (the hex codec below already rejects
/// anything that would grow this large in practice).
pub fn encode(id: &[u8], payload: &[u8]) -> Vec<u8> {
    assert!(id.len() <= MAX_ID_LEN, "message-id too long to frame");

    let id_len = (id.len() + 1) as u8;
    let total_len = (PREFIX_LEN + id.len() + payload.len()) as u64;

    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf.push(id_len);
    buf.extend_from_slice(id);
    buf.extend_from_slice(payload);
    buf
}

/// Decodes one record out of `buf`, which must contain *exactly* one
/// complete frame (`buf.len() == total_len`). Returns `(id, payload)`.
///
/// Buffer-level partial-frame detection (is there a full frame available
/// yet?) lives in [`crate::buffer::CycleBuffer`]; this function only
/// validates and splits an already-delimited slice.
pub fn decode(buf: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if buf.len() < PREFIX_LEN {
        return Err(Error::simple(ErrorKind::Framing))
            .wrapped_msg_framing("record shorter than the fixed prefix");
    }

    let mut total_len_bytes = [0u8; 8];
    total_len_bytes.copy_from_slice(&buf[0..8]);
    let total_len = u64::from_le_bytes(total_len_bytes);

    if total_len < PREFIX_LEN as u64 {
        return Err(Error::simple(ErrorKind::Framing))
            .wrapped_msg_framing("total_len smaller than the fixed prefix");
    }
    if total_len as usize != buf.len() {
        return Err(Error::simple(ErrorKind::Framing))
            .wrapped_msg_framing("total_len does not match the supplied slice");
    }

    let id_len = buf[8];
    if id_len < 1 {
        return Err(Error::simple(ErrorKind::Framing)).wrapped_msg_framing("id_len must be >= 1");
    }

    let id_len = id_len as usize;
    let payload_start = PREFIX_LEN + (id_len - 1);
    if payload_start > buf.len() {
        return Err(Error::simple(ErrorKind::Framing))
            .wrapped_msg_framing("id_len overruns the record");
    }

    let id = buf[PREFIX_LEN..payload_start].to_vec();
    let payload = buf[payload_start..].to_vec();
    Ok((id, payload))
}

/// Reads just the `total_len` prefix of a record, if at least
/// [`PREFIX_LEN`] bytes are available. Used by `CycleBuffer::can_read`
/// to decide whether a full frame has arrived yet.
pub fn peek_total_len(prefix: &[u8]) -> Option<u64> {
    if prefix.len() < 8 {
        return None;
    }
    let mut total_len_bytes = [0u8; 8];
    total_len_bytes.copy_from_slice(&prefix[0..8]);
    Some(u64::from_le_bytes(total_len_bytes))
}

trait FramingErrExt<T> {
    fn wrapped_msg_framing(self, msg: &str) -> Result<T>;
}

impl<T> FramingErrExt<T> for std::result::Result<T, Error> {
    fn wrapped_msg_framing(self, msg: &str) -> Result<T> {
        self.map_err(|e| Error::wrapped(ErrorKind::Framing, format!("{}: {}", msg, e)))
    }
}

/// Converts a hex-encoded message-id (pairs of `[0-9a-fA-F]`) into its
/// binary form, halving the string's length.
///
/// The distilled spec describes the accepted charset more broadly as
/// `[0-9A-Za-z]`; we parse strictly as case-insensitive hex nibbles. See
/// DESIGN.md for why the broader character class is read as "what's
/// *typically* seen on the wire" rather than a literal base-62 packing
/// rule — there's no surviving original-language source to confirm the
/// latter, and strict hex is the only interpretation that actually halves
/// the string length bijectively, as required by the round-trip property.
pub fn hex_to_bytes(id: &str) -> Result<Vec<u8>> {
    if id.len() % 2 != 0 {
        return Err(Error::simple(ErrorKind::Framing))
            .wrapped_msg_framing("hex message-id must have even length");
    }
    let bytes = id.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let hi = nibble(pair[0])?;
        let lo = nibble(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

/// Converts a binary message-id back into its hex representation
/// (lower-case), the inverse of [`hex_to_bytes`].
pub fn bytes_to_hex(id: &[u8]) -> String {
    let mut s = String::with_capacity(id.len() * 2);
    for b in id {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::simple(ErrorKind::Framing))
            .wrapped_msg_framing("message-id byte is not a hex digit"),
    }
}

/// Converts a public, textual message-id into its on-wire binary form,
/// honoring the `id_literal_text` build flag from the distilled spec's
/// §4.2 ("A build flag may keep the id as literal text").
pub fn encode_id(id: &str) -> Result<Vec<u8>> {
    #[cfg(feature = "id_literal_text")]
    {
        Ok(id.as_bytes().to_vec())
    }
    #[cfg(not(feature = "id_literal_text"))]
    {
        hex_to_bytes(id)
    }
}

/// Converts an on-wire binary message-id back into its public, textual
/// form. Inverse of [`encode_id`].
pub fn decode_id(id: &[u8]) -> String {
    #[cfg(feature = "id_literal_text")]
    {
        String::from_utf8_lossy(id).into_owned()
    }
    #[cfg(not(feature = "id_literal_text"))]
    {
        bytes_to_hex(id)
    }
}

use crate::error::ResultWrappedExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_id_and_payload() {
        let id = b"\xf0\x0d";
        let payload = b"hello";
        let record = encode(id, payload);
        let (out_id, out_payload) = decode(&record).unwrap();
        assert_eq!(out_id, id);
        assert_eq!(out_payload, payload);
    }

    #[test]
    fn round_trips_empty_payload() {
        let id = b"x";
        let record = encode(id, b"");
        let (out_id, out_payload) = decode(&record).unwrap();
        assert_eq!(out_id, id);
        assert!(out_payload.is_empty());
    }

    #[test]
    fn total_len_counts_its_own_bytes() {
        let record = encode(b"ab", b"1234");
        let mut total_len_bytes = [0u8; 8];
        total_len_bytes.copy_from_slice(&record[0..8]);
        let total_len = u64::from_le_bytes(total_len_bytes);
        assert_eq!(total_len as usize, record.len());
        assert_eq!(total_len as usize, PREFIX_LEN + 2 + 4);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_zero_id_len() {
        let mut record = encode(b"a", b"payload");
        record[8] = 0;
        assert!(decode(&record).is_err());
    }

    #[test]
    fn rejects_mismatched_total_len() {
        let mut record = encode(b"a", b"payload");
        record[0] = 0xff;
        assert!(decode(&record).is_err());
    }

    #[test]
    fn hex_bin_bijection_on_even_length_input() {
        for id in ["f00d", "00", "ffffffff", "0a1b2c3d"] {
            let bin = hex_to_bytes(id).unwrap();
            assert_eq!(bytes_to_hex(&bin), id);
        }
    }

    #[test]
    fn hex_rejects_odd_length() {
        assert!(hex_to_bytes("abc").is_err());
    }

    #[test]
    fn hex_rejects_non_hex_alnum() {
        assert!(hex_to_bytes("zz").is_err());
    }

    #[test]
    fn hex_is_case_insensitive() {
        assert_eq!(hex_to_bytes("F00D").unwrap(), hex_to_bytes("f00d").unwrap());
    }
}
