//! UTF-8 reassembly across arbitrary chunk boundaries.

/// Decodes a byte stream chunk by chunk, holding back a trailing incomplete
/// multi-byte sequence until the bytes that complete it arrive.
///
/// Invalid sequences (as opposed to incomplete ones) are replaced with
/// U+FFFD so one bad byte never stalls the stream.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, prefixed by any bytes held back from the previous call.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        out.push_str(valid);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Flush whatever is held back, lossily. Used when the stream ends.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_character() {
        // "é" is 0xC3 0xA9, "€" is 0xE2 0x82 0xAC.
        let mut acc = Utf8Accumulator::new();
        assert_eq!(acc.push(b"caf\xC3"), "caf");
        assert_eq!(acc.pending(), b"\xC3");
        assert_eq!(acc.push(b"\xA9 \xE2\x82"), "é ");
        assert_eq!(acc.push(b"\xAC!"), "€!");
        assert!(acc.pending().is_empty());
    }

    #[test]
    fn test_four_byte_sequence_one_byte_at_a_time() {
        let crab = "🦀".as_bytes();
        let mut acc = Utf8Accumulator::new();
        let mut out = String::new();
        for b in crab {
            out.push_str(&acc.push(std::slice::from_ref(b)));
        }
        assert_eq!(out, "🦀");
    }

    #[test]
    fn test_invalid_bytes_are_replaced_not_held() {
        let mut acc = Utf8Accumulator::new();
        assert_eq!(acc.push(b"a\xFFb"), "a\u{FFFD}b");
        assert!(acc.pending().is_empty());
    }

    #[test]
    fn test_finish_flushes_partial_sequence() {
        let mut acc = Utf8Accumulator::new();
        assert_eq!(acc.push(b"x\xE2\x82"), "x");
        assert_eq!(acc.finish(), "\u{FFFD}");
        assert!(acc.pending().is_empty());
    }
}
