//! Text ⇄ byte conversion for the wire.
//!
//! Encoding is plain UTF-8. Decoding is where the work is: a socket read can
//! stop anywhere, including inside a multi-byte character, so [`decode`] only
//! converts the longest valid prefix of what it is given and leaves the rest in
//! the buffer for the next read to complete.
//!
//! - [`encode`] / [`decode`]: the stateless pair.
//! - [`scan`]: classifies a byte slice into a valid prefix and a [`Tail`].
//! - [`StreamDecoder`]: owns the decode buffer across reads and applies a
//!   [`MalformedPolicy`].

mod stream;

pub use stream::{MalformedPolicy, StreamDecoder};

use bytes::Bytes;

/// Encodes `text` as UTF-8.
pub fn encode(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Decodes the longest valid UTF-8 prefix of `buffer`.
///
/// The decoded bytes are removed from `buffer`; whatever could not be decoded
/// (a character truncated by the end of the buffer, or a malformed sequence and
/// everything after it) is moved to the front so the next read can be appended
/// behind it. When everything was consumed the buffer is left empty.
///
/// This never fails: an undecodable buffer yields an empty string and stays
/// untouched.
///
/// ```
/// let mut buffer = "café".as_bytes()[..4].to_vec();
///
/// assert_eq!(tideline::decode(&mut buffer), "caf");
/// assert_eq!(buffer, [0xC3]);
///
/// buffer.push(0xA9);
/// assert_eq!(tideline::decode(&mut buffer), "é");
/// assert!(buffer.is_empty());
/// ```
pub fn decode(buffer: &mut Vec<u8>) -> String {
    let valid_up_to = scan(buffer).valid_up_to();

    if valid_up_to == buffer.len() {
        return take_valid(std::mem::take(buffer));
    }

    let remainder = buffer.split_off(valid_up_to);
    take_valid(std::mem::replace(buffer, remainder))
}

/// What follows the valid prefix of a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    /// The whole slice is valid.
    Complete,

    /// The slice ends with the first `len` bytes of a legal sequence.
    Incomplete { len: usize },

    /// `len` bytes at the end of the prefix can never start valid text.
    Malformed { len: usize },
}

/// The result of [`scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan<'a> {
    pub valid: &'a str,
    pub tail: Tail,
}

impl Scan<'_> {
    /// Offset of the first byte that is not part of [`valid`](Self::valid).
    pub fn valid_up_to(&self) -> usize {
        self.valid.len()
    }
}

/// Splits `bytes` into its longest valid UTF-8 prefix and a [`Tail`].
pub fn scan(bytes: &[u8]) -> Scan<'_> {
    match std::str::from_utf8(bytes) {
        Ok(valid) => Scan {
            valid,
            tail: Tail::Complete,
        },
        Err(error) => {
            let valid_up_to = error.valid_up_to();

            // The validator accepted every byte before `valid_up_to`.
            let valid = std::str::from_utf8(&bytes[..valid_up_to]).unwrap_or_default();

            let tail = match error.error_len() {
                None => Tail::Incomplete {
                    len: bytes.len() - valid_up_to,
                },
                Some(len) => Tail::Malformed { len },
            };

            Scan { valid, tail }
        }
    }
}

/// Converts bytes already known to be valid UTF-8.
fn take_valid(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|error| String::from_utf8_lossy(error.as_bytes()).into_owned())
}
