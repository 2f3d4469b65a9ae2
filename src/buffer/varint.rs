//! Variable-width integers
//!
//! 7 data bits per byte, least significant group first, high bit set on
//! every byte except the last.

use bytes::BufMut;

use super::{BufferError, BufferResult};

/// Maximum encoded size of a 32-bit var int
pub const MAX_VAR_INT_LEN: usize = 5;

/// Maximum encoded size of a 64-bit var long
pub const MAX_VAR_LONG_LEN: usize = 10;

/// Number of bytes `value` occupies once encoded
pub fn var_int_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

pub fn put_var_int<B: BufMut>(buf: &mut B, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn put_var_long<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a var int from the front of `src` without consuming it.
///
/// Returns `Ok(None)` if `src` ends before the var int does, otherwise the
/// value and the number of bytes it spans.
pub fn peek_var_int(src: &[u8]) -> BufferResult<Option<(u32, usize)>> {
    let mut value = 0u32;
    for (i, &byte) in src.iter().take(MAX_VAR_INT_LEN).enumerate() {
        if i == MAX_VAR_INT_LEN - 1 && byte > 0x0F {
            return Err(BufferError::VarIntTooLong);
        }
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if src.len() >= MAX_VAR_INT_LEN {
        Err(BufferError::VarIntTooLong)
    } else {
        Ok(None)
    }
}

/// 64-bit counterpart of [`peek_var_int`]
pub fn peek_var_long(src: &[u8]) -> BufferResult<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, &byte) in src.iter().take(MAX_VAR_LONG_LEN).enumerate() {
        if i == MAX_VAR_LONG_LEN - 1 && byte > 0x01 {
            return Err(BufferError::VarIntTooLong);
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if src.len() >= MAX_VAR_LONG_LEN {
        Err(BufferError::VarIntTooLong)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_small_values_use_one_byte() {
        let mut buf = BytesMut::new();
        put_var_int(&mut buf, 0x7F);
        assert_eq!(&buf[..], &[0x7F]);
        assert_eq!(var_int_len(0x7F), 1);
    }

    #[test]
    fn test_known_encoding() {
        let mut buf = BytesMut::new();
        put_var_int(&mut buf, 300);
        assert_eq!(&buf[..], &[0xAC, 0x02]);
        assert_eq!(peek_var_int(&buf).unwrap(), Some((300, 2)));
    }

    #[test]
    fn test_length_matches_encoding() {
        for value in [0u32, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, u32::MAX] {
            let mut buf = BytesMut::new();
            put_var_int(&mut buf, value);
            assert_eq!(buf.len(), var_int_len(value), "value {}", value);
            assert_eq!(peek_var_int(&buf).unwrap(), Some((value, buf.len())));
        }
    }

    #[test]
    fn test_incomplete_var_int() {
        assert_eq!(peek_var_int(&[0x80, 0x80]).unwrap(), None);
        assert_eq!(peek_var_int(&[]).unwrap(), None);
    }

    #[test]
    fn test_overlong_var_int_rejected() {
        let err = peek_var_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, BufferError::VarIntTooLong));
    }

    #[test]
    fn test_var_long_max() {
        let mut buf = BytesMut::new();
        put_var_long(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VAR_LONG_LEN);
        assert_eq!(peek_var_long(&buf).unwrap(), Some((u64::MAX, MAX_VAR_LONG_LEN)));
    }
}
