//! Shared binary encoding primitives.
//!
//! Two encodings meet in this crate: the little-endian, checksummed records
//! of the meta action log, and the big-endian (network order) create/update
//! messages delivered by the transport. Both are built on `bytes::{Buf,
//! BufMut}`; every read here is bounds-checked so truncated input surfaces
//! as an error instead of a panic.

use bytes::{Buf, BufMut};
use snafu::Snafu;

/// Result type for low-level decode operations.
pub(crate) type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while decoding binary payloads.
///
/// These are mapped into [`crate::MetaError`] at the call site: corruption
/// for action-log records, invalid-message for transport input.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub(crate) enum CodecError {
    /// The buffer ended before the expected field.
    #[snafu(display("unexpected end of input: needed {needed} bytes, {remaining} remaining"))]
    UnexpectedEof { needed: usize, remaining: usize },

    /// The trailing checksum does not match the content.
    #[snafu(display("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"))]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// A length-prefixed string is not valid UTF-8.
    #[snafu(display("string field is not valid UTF-8"))]
    InvalidUtf8,

    /// A tag byte does not name a known variant.
    #[snafu(display("invalid {what} tag {value}"))]
    InvalidTag { what: &'static str, value: u8 },
}

/// Number of bytes occupied by the trailing checksum.
pub(crate) const CHECKSUM_LEN: usize = 4;

pub(crate) fn need(remaining: usize, needed: usize) -> CodecResult<()> {
    if remaining < needed {
        return Err(CodecError::UnexpectedEof { needed, remaining });
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> CodecResult<u8> {
    need(buf.len(), 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16_le(buf: &mut &[u8]) -> CodecResult<u16> {
    need(buf.len(), 2)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn get_i16_le(buf: &mut &[u8]) -> CodecResult<i16> {
    need(buf.len(), 2)?;
    Ok(buf.get_i16_le())
}

pub(crate) fn get_u32_le(buf: &mut &[u8]) -> CodecResult<u32> {
    need(buf.len(), 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_i32_le(buf: &mut &[u8]) -> CodecResult<i32> {
    need(buf.len(), 4)?;
    Ok(buf.get_i32_le())
}

pub(crate) fn get_u64_le(buf: &mut &[u8]) -> CodecResult<u64> {
    need(buf.len(), 8)?;
    Ok(buf.get_u64_le())
}

pub(crate) fn get_u16_be(buf: &mut &[u8]) -> CodecResult<u16> {
    need(buf.len(), 2)?;
    Ok(buf.get_u16())
}

pub(crate) fn get_i16_be(buf: &mut &[u8]) -> CodecResult<i16> {
    need(buf.len(), 2)?;
    Ok(buf.get_i16())
}

pub(crate) fn get_i32_be(buf: &mut &[u8]) -> CodecResult<i32> {
    need(buf.len(), 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_u64_be(buf: &mut &[u8]) -> CodecResult<u64> {
    need(buf.len(), 8)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_bytes(buf: &mut &[u8], len: usize) -> CodecResult<Vec<u8>> {
    need(buf.len(), len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Write a u16-length-prefixed string, little-endian length.
pub(crate) fn put_str16_le(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Read a u16-length-prefixed string, little-endian length.
pub(crate) fn get_str16_le(buf: &mut &[u8]) -> CodecResult<String> {
    let len = get_u16_le(buf)? as usize;
    let raw = get_bytes(buf, len)?;
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
}

/// Write a u16-length-prefixed string, big-endian length (wire messages).
pub(crate) fn put_str16_be(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Read a u16-length-prefixed string, big-endian length (wire messages).
pub(crate) fn get_str16_be(buf: &mut &[u8]) -> CodecResult<String> {
    let len = get_u16_be(buf)? as usize;
    let raw = get_bytes(buf, len)?;
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
}

/// Append the crc32 of `content` to `buf`, little-endian.
pub(crate) fn put_checksum(buf: &mut Vec<u8>, content: &[u8]) {
    buf.put_u32_le(crc32fast::hash(content));
}

/// Verify a content block whose last four bytes are its little-endian crc32
/// and return the content without the checksum.
pub(crate) fn verify_checksum(cont: &[u8]) -> CodecResult<&[u8]> {
    if cont.len() < CHECKSUM_LEN {
        return Err(CodecError::UnexpectedEof {
            needed: CHECKSUM_LEN,
            remaining: cont.len(),
        });
    }
    let (payload, tail) = cont.split_at(cont.len() - CHECKSUM_LEN);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }
    Ok(payload)
}
