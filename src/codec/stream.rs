use super::{Tail, decode, scan};

/// What a [`StreamDecoder`] does with bytes that can never become valid text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Keep malformed bytes in the remainder, like a truncated character.
    ///
    /// Nothing after them is ever emitted and the decoder reports itself as
    /// [stalled](StreamDecoder::is_stalled).
    #[default]
    Retain,

    /// Emit U+FFFD for each malformed sequence and keep decoding behind it.
    ///
    /// A character truncated by the end of the buffer is still retained.
    Replace,
}

/// Incremental UTF-8 decoder for a byte stream.
///
/// `StreamDecoder` owns the decode buffer of one connection. Every
/// [`feed`](Self::feed) appends the newly read bytes behind the remainder of
/// the previous call and returns the text that became decodable. The buffer
/// always holds exactly the suffix of the stream not yet returned as text.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    policy: MalformedPolicy,
    replaced: u64,
}

impl StreamDecoder {
    pub fn new(policy: MalformedPolicy) -> Self {
        Self {
            buffer: Vec::new(),
            policy,
            replaced: 0,
        }
    }

    /// Appends `bytes` and returns the text decodable so far.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        self.buffer.extend_from_slice(bytes);

        match self.policy {
            MalformedPolicy::Retain => decode(&mut self.buffer),
            MalformedPolicy::Replace => self.decode_replacing(),
        }
    }

    /// Bytes received but not yet returned as text.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether the remainder starts with a malformed sequence.
    ///
    /// Under [`MalformedPolicy::Retain`] a stalled decoder never emits text
    /// again: every later byte queues up behind the malformed one.
    pub fn is_stalled(&self) -> bool {
        matches!(scan(&self.buffer).tail, Tail::Malformed { .. })
    }

    /// Number of malformed sequences replaced so far.
    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    /// Ends the stream and hands back the bytes that never became text.
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }

    fn decode_replacing(&mut self) -> String {
        let mut text = String::with_capacity(self.buffer.len());
        let mut good = 0;

        loop {
            let scanned = scan(&self.buffer[good..]);
            text.push_str(scanned.valid);
            good += scanned.valid_up_to();

            match scanned.tail {
                Tail::Complete | Tail::Incomplete { .. } => break,
                Tail::Malformed { len } => {
                    text.push(char::REPLACEMENT_CHARACTER);
                    good += len;
                    self.replaced += 1;
                }
            }
        }

        self.buffer.drain(..good);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_split_character_between_feeds() {
        let mut decoder = StreamDecoder::default();
        let bytes = "naïve".as_bytes();

        assert_eq!(decoder.feed(&bytes[..3]), "na");
        assert_eq!(decoder.remainder(), &bytes[2..3]);
        assert!(!decoder.is_stalled());

        assert_eq!(decoder.feed(&bytes[3..]), "ïve");
        assert!(decoder.remainder().is_empty());
    }

    #[test]
    fn one_byte_at_a_time() {
        let text = "ağ€🦀z";
        let mut decoder = StreamDecoder::default();
        let mut out = String::new();

        for byte in text.as_bytes() {
            out.push_str(&decoder.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(out, text);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn retain_policy_stalls_on_malformed_input() {
        let mut decoder = StreamDecoder::new(MalformedPolicy::Retain);

        assert_eq!(decoder.feed(&[b'h', b'i', 0xFE]), "hi");
        assert!(decoder.is_stalled());

        assert_eq!(decoder.feed(b"there"), "");
        assert!(decoder.is_stalled());
        assert_eq!(decoder.finish(), [0xFE, b't', b'h', b'e', b'r', b'e']);
    }

    #[test]
    fn replace_policy_skips_malformed_input() {
        let mut decoder = StreamDecoder::new(MalformedPolicy::Replace);

        let text = decoder.feed(&[b'h', b'i', 0xFE, b'!', 0xC0, 0x80]);
        assert_eq!(text, "hi\u{FFFD}!\u{FFFD}\u{FFFD}");
        assert!(!decoder.is_stalled());
        assert_eq!(decoder.replaced(), 3);
        assert!(decoder.remainder().is_empty());
    }

    #[test]
    fn replace_policy_still_retains_truncated_tail() {
        let mut decoder = StreamDecoder::new(MalformedPolicy::Replace);
        let euro = "€".as_bytes();

        let mut first = vec![0xFF];
        first.extend_from_slice(&euro[..1]);

        assert_eq!(decoder.feed(&first), "\u{FFFD}");
        assert_eq!(decoder.remainder(), &euro[..1]);

        assert_eq!(decoder.feed(&euro[1..]), "€");
        assert_eq!(decoder.replaced(), 1);
    }
}
