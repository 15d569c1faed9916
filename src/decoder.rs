/// Incremental UTF-8 decoder for raw backend chunks.
///
/// Backends stream bytes, and a chunk boundary may fall inside a multi-byte
/// code point. The decoder keeps only the undecoded tail between calls and
/// yields a character once all of its bytes have arrived. Byte sequences that
/// can never become valid UTF-8 are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every character completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<char> {
        self.pending.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.extend(valid.chars());
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                        decoded.extend(valid.chars());
                    }
                    consumed += valid_up_to;
                    match e.error_len() {
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            consumed += invalid;
                        }
                        // Truncated code point at the end, wait for more bytes.
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        decoded
    }

    /// Number of bytes held back waiting for the rest of a code point.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flushes the decoder at end of stream. A truncated trailing code point
    /// becomes U+FFFD.
    pub fn finish(&mut self) -> Option<char> {
        if self.pending.is_empty() {
            None
        } else {
            self.pending.clear();
            Some(char::REPLACEMENT_CHARACTER)
        }
    }
}
