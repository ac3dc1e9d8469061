//! Buffer-level encoding helpers for request and block payloads.
//!
//! These mirror the on-wire framing ([`crate::wire`]) but operate on byte
//! buffers: a [`crate::model::SearchQuery`] is serialized once and the same
//! bytes are sent to every storage node, and metric blocks are staged in the
//! temporary block store in marshaled form.

use thiserror::Error;

/// Errors produced while decoding marshaled payloads
#[derive(Error, Debug)]
pub enum MarshalError {
    /// The buffer ended before the declared value
    #[error("unexpected end of data: need {need} bytes, got {got}")]
    UnexpectedEod { need: usize, got: usize },

    /// A length prefix exceeded the ceiling for its field
    #[error("too big data size: {size}; it must not exceed {max} bytes")]
    TooLarge { size: u64, max: usize },

    /// Leftover bytes after a value that must consume its whole buffer
    #[error("unexpected {0} trailing bytes after unmarshaling")]
    TrailingData(usize),

    /// A payload is structurally invalid
    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Result type alias for unmarshal operations
pub type MarshalResult<T> = Result<T, MarshalError>;

pub fn append_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn append_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn append_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&(v as u64).to_be_bytes());
}

pub fn append_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_bits().to_be_bytes());
}

pub fn append_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

pub fn append_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    append_u64(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn take_u32(buf: &[u8]) -> MarshalResult<(u32, &[u8])> {
    let (head, tail) = split(buf, 4)?;
    Ok((u32::from_be_bytes(head.try_into().unwrap()), tail))
}

pub fn take_u64(buf: &[u8]) -> MarshalResult<(u64, &[u8])> {
    let (head, tail) = split(buf, 8)?;
    Ok((u64::from_be_bytes(head.try_into().unwrap()), tail))
}

pub fn take_i64(buf: &[u8]) -> MarshalResult<(i64, &[u8])> {
    let (v, tail) = take_u64(buf)?;
    Ok((v as i64, tail))
}

pub fn take_f64(buf: &[u8]) -> MarshalResult<(f64, &[u8])> {
    let (v, tail) = take_u64(buf)?;
    Ok((f64::from_bits(v), tail))
}

pub fn take_bool(buf: &[u8]) -> MarshalResult<(bool, &[u8])> {
    let (head, tail) = split(buf, 1)?;
    Ok((head[0] != 0, tail))
}

pub fn take_bytes(buf: &[u8], max: usize) -> MarshalResult<(&[u8], &[u8])> {
    let (size, tail) = take_u64(buf)?;
    if size > max as u64 {
        return Err(MarshalError::TooLarge { size, max });
    }
    split(tail, size as usize)
}

fn split(buf: &[u8], n: usize) -> MarshalResult<(&[u8], &[u8])> {
    if buf.len() < n {
        return Err(MarshalError::UnexpectedEod {
            need: n,
            got: buf.len(),
        });
    }
    Ok(buf.split_at(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut buf = Vec::new();
        append_u32(&mut buf, 7);
        append_u64(&mut buf, u64::MAX);
        append_i64(&mut buf, -5);
        append_f64(&mut buf, 2.5);
        append_bool(&mut buf, true);
        append_bytes(&mut buf, b"tag");

        let b = buf.as_slice();
        let (v, b) = take_u32(b).unwrap();
        assert_eq!(v, 7);
        let (v, b) = take_u64(b).unwrap();
        assert_eq!(v, u64::MAX);
        let (v, b) = take_i64(b).unwrap();
        assert_eq!(v, -5);
        let (v, b) = take_f64(b).unwrap();
        assert_eq!(v, 2.5);
        let (v, b) = take_bool(b).unwrap();
        assert!(v);
        let (v, b) = take_bytes(b, 16).unwrap();
        assert_eq!(v, b"tag");
        assert!(b.is_empty());
    }

    #[test]
    fn test_take_bytes_enforces_cap() {
        let mut buf = Vec::new();
        append_bytes(&mut buf, &[0u8; 32]);
        assert!(matches!(
            take_bytes(&buf, 31),
            Err(MarshalError::TooLarge { size: 32, max: 31 })
        ));
    }

    #[test]
    fn test_truncated_scalar() {
        assert!(matches!(
            take_u64(&[1, 2, 3]),
            Err(MarshalError::UnexpectedEod { need: 8, got: 3 })
        ));
    }
}
