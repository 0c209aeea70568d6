//! Field-level encoding primitives
//!
//! Lengths and counts are unsigned LEB128 varints. Decoders operate on
//! `Bytes` so media payloads are split off without copying.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::MAX_VARINT_LEN;
use crate::error::DecodeError;

/// Append `value` as an unsigned LEB128 varint
pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Number of bytes `put_varint` writes for `value`
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Read an unsigned LEB128 varint
pub fn get_varint(buf: &mut Bytes) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let byte = buf.get_u8();
        // The tenth byte may only contribute the top bit
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(DecodeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::VarintOverflow)
}

/// Append a big-endian u64
pub fn put_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64(value);
}

/// Read a big-endian u64
pub fn get_u64(buf: &mut Bytes) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(buf.get_u64())
}

/// Append length-prefixed raw bytes
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Read length-prefixed raw bytes (zero-copy)
pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = get_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEof)?;
    if buf.remaining() < len {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(buf.split_to(len))
}

/// Append length-prefixed UTF-8 text
pub fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Read length-prefixed UTF-8 text
pub fn get_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: u64) -> Bytes {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, value);
        buf.freeze()
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(&encoded(0)[..], &[0x00]);
        assert_eq!(&encoded(127)[..], &[0x7f]);
        assert_eq!(&encoded(128)[..], &[0x80, 0x01]);
        assert_eq!(&encoded(300)[..], &[0xac, 0x02]);
        assert_eq!(encoded(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        for value in [0, 1, 127, 128, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            assert_eq!(varint_len(value), encoded(value).len(), "value {value}");
        }
    }

    #[test]
    fn test_varint_decode_max() {
        let mut buf = encoded(u64::MAX);
        assert_eq!(get_varint(&mut buf).unwrap(), u64::MAX);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_varint_overflow() {
        let mut buf = Bytes::from_static(&[0xff; 11]);
        assert_eq!(get_varint(&mut buf), Err(DecodeError::VarintOverflow));

        let mut buf = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02]);
        assert_eq!(get_varint(&mut buf), Err(DecodeError::VarintOverflow));
    }

    #[test]
    fn test_varint_truncated() {
        let mut buf = Bytes::from_static(&[0x80, 0x80]);
        assert_eq!(get_varint(&mut buf), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut buf = Bytes::from_static(&[0x02, 0xc3, 0x28]);
        assert_eq!(get_string(&mut buf), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_bytes_length_exceeds_buffer() {
        let mut buf = Bytes::from_static(&[0x05, 0x01, 0x02]);
        assert_eq!(get_bytes(&mut buf), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_u64_big_endian() {
        let mut buf = BytesMut::new();
        put_u64(&mut buf, 0x0102_0304_0506_0708);
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut short = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(get_u64(&mut short), Err(DecodeError::UnexpectedEof));
    }
}
