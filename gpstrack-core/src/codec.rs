//! Track codec: each fix is three zig-zag deltas (seconds, lat×1e5, lon×1e5) against the
//! previous fix, written as printable 5-bit chunks offset by 63. The first fix deltas from zero.
//!
//! A chunk whose value is below 0x20 ends a number, so appending fixes never rewrites
//! existing bytes and counting never has to reconstruct values.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::fix::Fix;

const CHUNK_BITS: u32 = 5;
const CHUNK_MASK: u64 = 0x1f;
const CONTINUATION: u64 = 0x20;
const CHAR_OFFSET: u8 = 63;
const FIELDS: usize = 3;

fn push_value(out: &mut String, delta: i64) {
    let shifted = delta << 1;
    let mut value = (if delta < 0 { !shifted } else { shifted }) as u64;
    while value >= CONTINUATION {
        out.push(char::from(
            ((value & CHUNK_MASK) | CONTINUATION) as u8 + CHAR_OFFSET,
        ));
        value >>= CHUNK_BITS;
    }
    out.push(char::from(value as u8 + CHAR_OFFSET));
}

/// Encode fixes standalone (first fix deltas from zero).
pub fn encode(fixes: &[Fix]) -> String {
    encode_from(None, fixes)
}

/// Encode `fixes` as a suffix for a track whose last fix is `prev`.
/// `encode(a ++ b) == encode(a) + encode_from(a.last(), b)`.
pub fn encode_from(prev: Option<&Fix>, fixes: &[Fix]) -> String {
    let mut out = String::with_capacity(fixes.len() * 12);
    let mut last = prev.map(Fix::scaled).unwrap_or([0; FIELDS]);
    for fix in fixes {
        let current = fix.scaled();
        for i in 0..FIELDS {
            push_value(&mut out, current[i] - last[i]);
        }
        last = current;
    }
    out
}

/// Decode a standalone encoded track.
pub fn decode(s: &str) -> Result<Vec<Fix>, CodecError> {
    decode_from(None, s)
}

/// Decode an encoded suffix relative to the last fix the receiver already holds.
/// This is how a receiver applies the output of [`diff`].
pub fn decode_from(prev: Option<&Fix>, s: &str) -> Result<Vec<Fix>, CodecError> {
    FixDecoder::new(s, prev).collect()
}

/// Number of fixes in `s`, counting terminal chunks only.
pub fn count(s: &str) -> usize {
    s.bytes()
        .filter(|&c| (c as i32) - (CHAR_OFFSET as i32) < CONTINUATION as i32)
        .count()
        / FIELDS
}

/// Last fix of an encoded track, if any.
pub fn last_fix(s: &str) -> Result<Option<Fix>, CodecError> {
    let mut last = None;
    for fix in FixDecoder::new(s, None) {
        last = Some(fix?);
    }
    Ok(last)
}

/// Fixes with `from_ts <= timestamp <= to_ts`, re-encoded standalone, and their count.
///
/// Stops decoding at the first fix past `to_ts`. Only the first retained fix is re-based;
/// the bytes of the following fixes are copied unchanged since their deltas do not move.
pub fn extract_interval(s: &str, from_ts: i64, to_ts: i64) -> Result<(String, usize), CodecError> {
    if from_ts > to_ts {
        return Ok((String::new(), 0));
    }
    let mut decoder = FixDecoder::new(s, None);
    let mut first: Option<Fix> = None;
    let mut tail_start = 0;
    let mut tail_end = 0;
    let mut n = 0;
    while let Some(fix) = decoder.next() {
        let fix = fix?;
        if fix.timestamp > to_ts {
            break;
        }
        if fix.timestamp < from_ts {
            continue;
        }
        if first.is_none() {
            first = Some(fix);
            tail_start = decoder.offset();
        }
        tail_end = decoder.offset();
        n += 1;
    }
    let Some(first) = first else {
        return Ok((String::new(), 0));
    };
    let mut out = encode(&[first]);
    out.push_str(&s[tail_start..tail_end]);
    Ok((out, n))
}

/// What a receiver holding `old` must apply to reach `new`.
///
/// When `old` is a byte prefix of `new` this is the remaining suffix. Otherwise the fixes of
/// `new` whose timestamps are absent from `old` are encoded relative to the last fix of `old`.
pub fn diff(old: &str, new: &str) -> Result<String, CodecError> {
    if let Some(suffix) = new.strip_prefix(old) {
        return Ok(suffix.to_string());
    }
    let old_fixes = decode(old)?;
    let known: HashSet<i64> = old_fixes.iter().map(|f| f.timestamp).collect();
    let missing: Vec<Fix> = decode(new)?
        .into_iter()
        .filter(|f| !known.contains(&f.timestamp))
        .collect();
    Ok(encode_from(old_fixes.last(), &missing))
}

/// Short content digest of an encoded track, for cache keys and change detection.
pub fn digest(s: &str) -> String {
    let hash = Sha256::digest(s.as_bytes());
    hash[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Error decoding an encoded track.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid character 0x{byte:02x} at offset {offset}")]
    InvalidChar { offset: usize, byte: u8 },
    #[error("truncated fix at offset {offset}")]
    Truncated { offset: usize },
    #[error("value overflow at offset {offset}")]
    Overflow { offset: usize },
}

/// Streaming decoder over an encoded track. Yields one fix per three values.
struct FixDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    last: [i64; FIELDS],
}

impl<'a> FixDecoder<'a> {
    fn new(s: &'a str, prev: Option<&Fix>) -> Self {
        Self {
            bytes: s.as_bytes(),
            pos: 0,
            last: prev.map(Fix::scaled).unwrap_or([0; FIELDS]),
        }
    }

    /// Byte offset just past the last decoded fix.
    fn offset(&self) -> usize {
        self.pos
    }

    fn next_value(&mut self) -> Result<i64, CodecError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let Some(&c) = self.bytes.get(self.pos) else {
                return Err(CodecError::Truncated { offset: self.pos });
            };
            let offset = self.pos;
            let chunk = match c.checked_sub(CHAR_OFFSET) {
                Some(b) if (b as u64) < 2 * CONTINUATION => b as u64,
                _ => return Err(CodecError::InvalidChar { offset, byte: c }),
            };
            if shift > 60 {
                return Err(CodecError::Overflow { offset });
            }
            self.pos += 1;
            result |= (chunk & CHUNK_MASK) << shift;
            shift += CHUNK_BITS;
            if chunk < CONTINUATION {
                break;
            }
        }
        let value = if result & 1 == 1 {
            !(result >> 1)
        } else {
            result >> 1
        };
        Ok(value as i64)
    }
}

impl Iterator for FixDecoder<'_> {
    type Item = Result<Fix, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let mut current = self.last;
        for slot in current.iter_mut() {
            match self.next_value() {
                Ok(delta) => *slot = slot.wrapping_add(delta),
                Err(e) => {
                    // Poison: stop after the first error.
                    self.pos = self.bytes.len();
                    return Some(Err(e));
                }
            }
        }
        self.last = current;
        Some(Ok(Fix::from_scaled(current)))
    }
}
