//! Order-preserving binary codecs (spec.md §4.1).
//!
//! Both encodings are designed so that comparing the encoded bytes
//! lexicographically gives the same answer as comparing the original
//! numbers — this is what lets log file names and on-disk keys sort
//! correctly with a plain byte-string comparison.

use raftkv_core::FlipSign;

use crate::error::{RaftError, Result};

const SIGNED_MIN_SINGLE_BYTE: u8 = 0x09;
const SIGNED_MAX_SINGLE_BYTE: u8 = 0xF6;
const SIGNED_CENTER: i64 = 127;
const SIGNED_SINGLE_BYTE_MIN_VALUE: i64 = SIGNED_MIN_SINGLE_BYTE as i64 - SIGNED_CENTER; // -118
const SIGNED_SINGLE_BYTE_MAX_VALUE: i64 = SIGNED_MAX_SINGLE_BYTE as i64 - SIGNED_CENTER; // 119

/// Encodes a signed 64-bit integer into 1-9 bytes such that the encoded
/// byte strings sort in the same order as the numeric values.
pub fn encode_signed_long(value: i64) -> Vec<u8> {
    if (SIGNED_SINGLE_BYTE_MIN_VALUE..=SIGNED_SINGLE_BYTE_MAX_VALUE).contains(&value) {
        return vec![(value + SIGNED_CENTER) as u8];
    }

    if value < SIGNED_SINGLE_BYTE_MIN_VALUE {
        // Negative, multi-byte. Encode the distance below the single-byte
        // floor as a big-endian magnitude; more extra bytes -> more
        // negative -> smaller leading byte, preserving sort order.
        let magnitude = (SIGNED_SINGLE_BYTE_MIN_VALUE - 1 - value) as u64;
        let extra = minimal_be_bytes_at_least_one(magnitude);
        let width = extra.len();
        let first = SIGNED_MIN_SINGLE_BYTE - width as u8;
        let mut out = Vec::with_capacity(1 + width);
        out.push(first);
        // Larger magnitude (more negative) must sort first (smaller bytes),
        // so store the ones'-complement of the magnitude within its width.
        let max_for_width = ((1u128 << (8 * width)) - 1) as u64;
        let inverted = max_for_width - magnitude;
        out.extend(pad_be_bytes(inverted, width));
        out
    } else {
        // Positive, multi-byte: symmetric construction above the single
        // byte ceiling.
        let magnitude = (value - SIGNED_SINGLE_BYTE_MAX_VALUE - 1) as u64;
        let extra = minimal_be_bytes_at_least_one(magnitude);
        let width = extra.len();
        let first = SIGNED_MAX_SINGLE_BYTE + width as u8;
        let mut out = Vec::with_capacity(1 + width);
        out.push(first);
        out.extend(pad_be_bytes(magnitude, width));
        out
    }
}

/// Decodes a value written by [`encode_signed_long`], returning the value
/// and the number of bytes consumed.
pub fn decode_signed_long(buf: &[u8]) -> Result<(i64, usize)> {
    let first = *buf.first().ok_or_else(|| RaftError::Codec("empty signed-long buffer".into()))?;

    if first == 0x00 || first == 0xFF {
        return Err(RaftError::Codec(format!("invalid signed-long leading byte 0x{first:02x}")));
    }

    if (SIGNED_MIN_SINGLE_BYTE..=SIGNED_MAX_SINGLE_BYTE).contains(&first) {
        return Ok((first as i64 - SIGNED_CENTER, 1));
    }

    if first < SIGNED_MIN_SINGLE_BYTE {
        let width = (SIGNED_MIN_SINGLE_BYTE - first) as usize;
        require_len(buf, 1 + width)?;
        let max_for_width: u64 = ((1u128 << (8 * width)) - 1) as u64;
        let inverted = read_be_bytes(&buf[1..1 + width]);
        let magnitude = max_for_width - inverted;
        let value = SIGNED_SINGLE_BYTE_MIN_VALUE - 1 - magnitude as i64;
        Ok((value, 1 + width))
    } else {
        let width = (first - SIGNED_MAX_SINGLE_BYTE) as usize;
        require_len(buf, 1 + width)?;
        let magnitude = read_be_bytes(&buf[1..1 + width]);
        let value = SIGNED_SINGLE_BYTE_MAX_VALUE + 1 + magnitude as i64;
        Ok((value, 1 + width))
    }
}

/// Encodes an unsigned 32-bit integer into 1-5 bytes, sort-preserving.
pub fn encode_unsigned_int(value: u32) -> Vec<u8> {
    const THRESHOLD: u32 = 0xFB;
    if value < THRESHOLD {
        return vec![value as u8];
    }

    let offset = (value - THRESHOLD) as u64;
    let extra = minimal_be_bytes_at_least_one(offset);
    let width = extra.len();
    let first = THRESHOLD as u8 + width as u8 - 1;
    let mut out = Vec::with_capacity(1 + width);
    out.push(first);
    out.extend(pad_be_bytes(offset, width));
    out
}

pub fn decode_unsigned_int(buf: &[u8]) -> Result<(u32, usize)> {
    const THRESHOLD: u8 = 0xFB;
    let first = *buf.first().ok_or_else(|| RaftError::Codec("empty unsigned-int buffer".into()))?;

    if first == 0xFF {
        return Err(RaftError::Codec("invalid unsigned-int leading byte 0xff".into()));
    }

    if first < THRESHOLD {
        return Ok((first as u32, 1));
    }

    let width = (first - THRESHOLD + 1) as usize;
    require_len(buf, 1 + width)?;
    let offset = read_be_bytes(&buf[1..1 + width]);
    let value = THRESHOLD as u64 + offset;
    Ok((value as u32, 1 + width))
}

fn require_len(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(RaftError::Codec(format!(
            "truncated codec buffer: need {len} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}

fn read_be_bytes(bytes: &[u8]) -> u64 {
    let mut v: u64 = 0;
    for b in bytes {
        v = (v << 8) | (*b as u64);
    }
    v
}

fn pad_be_bytes(value: u64, width: usize) -> Vec<u8> {
    let full = value.to_be_bytes();
    full[8 - width..].to_vec()
}

/// The minimal big-endian byte representation of `value` (no leading zero
/// bytes; empty for zero).
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![];
    }
    let full = value.to_be_bytes();
    let first_nonzero = full.iter().position(|b| *b != 0).unwrap();
    full[first_nonzero..].to_vec()
}

/// Same as [`minimal_be_bytes`] but a zero magnitude still needs a byte of
/// its own to occupy the multi-byte slot reserved for values outside the
/// single-byte range.
fn minimal_be_bytes_at_least_one(value: u64) -> Vec<u8> {
    let bytes = minimal_be_bytes(value);
    if bytes.is_empty() {
        vec![0]
    } else {
        bytes
    }
}

/// Sign-preserving helper retained for callers that need to reinterpret a
/// decoded unsigned magnitude as a signed delta (e.g. counter adjusts).
pub fn flip_i64(value: i64) -> u64 {
    value.flip()
}
