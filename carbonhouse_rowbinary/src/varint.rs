//! Unsigned LEB128 varints, byte-compatible with the store's `RowBinary` string prefix.

use std::io::{self, BufRead};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN64: usize = 10;

/// Append `v` to `buf`, returning the number of bytes written.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) -> usize {
    let start = buf.len();
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
    buf.len() - start
}

/// Number of bytes `v` occupies once encoded.
pub fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Read one varint from `r`.
///
/// Returns `UnexpectedEof` if the stream ends before the first byte, and
/// `InvalidData` if the value overflows 64 bits.
pub fn read_uvarint<R: BufRead>(r: &mut R) -> io::Result<u64> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for i in 0..MAX_VARINT_LEN64 {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        let b = byte[0];
        if b < 0x80 {
            if i == MAX_VARINT_LEN64 - 1 && b > 1 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64"));
            }
            return Ok(x | (u64::from(b) << s));
        }
        x |= u64::from(b & 0x7f) << s;
        s += 7;
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64"))
}

/// Decode a varint from the front of `buf`, returning the value and the bytes consumed.
pub fn decode_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN64) {
        if b < 0x80 {
            if i == MAX_VARINT_LEN64 - 1 && b > 1 {
                return None;
            }
            return Some((x | (u64::from(b) << s), i + 1));
        }
        x |= u64::from(b & 0x7f) << s;
        s += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_like_leb128() {
        let mut buf = vec![];
        assert_eq!(put_uvarint(&mut buf, 5), 1);
        assert_eq!(put_uvarint(&mut buf, 300), 2);
        assert_eq!(buf, vec![0x05, 0xac, 0x02]);
        assert_eq!(uvarint_len(300), 2);
        assert_eq!(uvarint_len(u64::MAX), MAX_VARINT_LEN64);
    }

    #[test]
    fn reads_back() {
        let mut buf = vec![];
        put_uvarint(&mut buf, 524288);
        let mut cursor = io::Cursor::new(buf.clone());
        assert_eq!(read_uvarint(&mut cursor).unwrap(), 524288);
        assert_eq!(decode_uvarint(&buf), Some((524288, buf.len())));
    }

    #[test]
    fn truncated_is_eof() {
        let mut cursor = io::Cursor::new(vec![0x80u8]);
        let err = read_uvarint(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(decode_uvarint(&[0x80]), None);
    }
}
