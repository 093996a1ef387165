//! Incremental UTF-8 validation.
//!
//! Text messages may be split across frames (and, in split delivery mode, across chunk
//! events) at arbitrary byte offsets, including in the middle of a multi-byte code point.
//! [`Utf8Validator`] checks bytes as they arrive and fails on the first byte that can never
//! become valid, while holding back a trailing incomplete sequence until more bytes show up.
//! [`Utf8Buffer`] pairs the validator with the bytes themselves so the validated prefix can be
//! handed out while the incomplete tail stays behind.

use bytes::{Bytes, BytesMut};

use crate::{Result, WebSocketError};

/// Outcome of checking a byte slice.
enum Check {
    Valid,
    /// `valid_up_to` bytes are complete, the rest is a prefix of a code point.
    Incomplete { valid_up_to: usize },
    Invalid,
}

#[cfg(not(feature = "simd"))]
#[inline]
fn check(bytes: &[u8]) -> Check {
    match std::str::from_utf8(bytes) {
        Ok(_) => Check::Valid,
        Err(e) if e.error_len().is_none() => Check::Incomplete {
            valid_up_to: e.valid_up_to(),
        },
        Err(_) => Check::Invalid,
    }
}

#[cfg(feature = "simd")]
#[inline]
fn check(bytes: &[u8]) -> Check {
    match simdutf8::compat::from_utf8(bytes) {
        Ok(_) => Check::Valid,
        Err(e) if e.error_len().is_none() => Check::Incomplete {
            valid_up_to: e.valid_up_to(),
        },
        Err(_) => Check::Invalid,
    }
}

/// Length of the sequence started by `lead`. Only called on bytes that already passed a
/// prefix check, so the lead byte is well formed.
#[inline]
fn sequence_len(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

/// Streaming validator that never buffers more than one incomplete code point.
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    tail: [u8; 4],
    tail_len: usize,
    valid_len: usize,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more bytes.
    ///
    /// Returns the number of bytes, counted over everything appended since the last
    /// [`reset`](Self::reset) or [`take_valid`](Self::take_valid), that form complete valid
    /// UTF-8. Fails as soon as a byte is seen that cannot be part of a valid sequence.
    pub fn append(&mut self, mut bytes: &[u8]) -> Result<usize> {
        if self.tail_len > 0 {
            let need = sequence_len(self.tail[0]) - self.tail_len;
            let take = need.min(bytes.len());
            self.tail[self.tail_len..self.tail_len + take].copy_from_slice(&bytes[..take]);
            self.tail_len += take;
            bytes = &bytes[take..];

            match check(&self.tail[..self.tail_len]) {
                Check::Valid => {
                    self.valid_len += self.tail_len;
                    self.tail_len = 0;
                }
                Check::Incomplete { .. } => return Ok(self.valid_len),
                Check::Invalid => return Err(WebSocketError::InvalidUTF8),
            }
        }

        match check(bytes) {
            Check::Valid => self.valid_len += bytes.len(),
            Check::Incomplete { valid_up_to } => {
                let rest = &bytes[valid_up_to..];
                self.valid_len += valid_up_to;
                self.tail[..rest.len()].copy_from_slice(rest);
                self.tail_len = rest.len();
            }
            Check::Invalid => return Err(WebSocketError::InvalidUTF8),
        }

        Ok(self.valid_len)
    }

    /// Number of bytes verified complete so far.
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    /// Number of bytes held back as the prefix of an unfinished code point.
    pub fn incomplete_len(&self) -> usize {
        self.tail_len
    }

    /// Total number of bytes accounted for.
    pub fn len(&self) -> usize {
        self.valid_len + self.tail_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the count of verified bytes and forgets them, keeping any incomplete tail.
    pub fn take_valid(&mut self) -> usize {
        std::mem::take(&mut self.valid_len)
    }

    /// Succeeds iff no incomplete sequence remains.
    pub fn finalize(&self) -> Result<()> {
        if self.tail_len == 0 {
            Ok(())
        } else {
            Err(WebSocketError::InvalidUTF8)
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Accumulates text bytes and hands out the part that is known to be valid.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    data: BytesMut,
    validator: Utf8Validator,
}

impl Utf8Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes, failing on the first invalid byte. Returns the length of the valid prefix.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize> {
        let valid = self.validator.append(bytes)?;
        self.data.extend_from_slice(bytes);
        Ok(valid)
    }

    /// Removes and returns the valid prefix. An incomplete trailing code point stays buffered.
    pub fn take_valid(&mut self) -> Bytes {
        let valid = self.validator.take_valid();
        self.data.split_to(valid).freeze()
    }

    /// Removes everything, failing if the buffer ends in the middle of a code point.
    pub fn finish(&mut self) -> Result<Bytes> {
        self.validator.finalize()?;
        self.validator.reset();
        Ok(self.data.split().freeze())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Length of the prefix [`take_valid`](Self::take_valid) would hand out.
    pub fn valid_len(&self) -> usize {
        self.validator.valid_len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.validator.reset();
    }
}
