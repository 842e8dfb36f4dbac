/// Incremental UTF-8 decoder.
///
/// A multi-byte character split between two chunks is held back until the rest of it arrives.
/// Sequences that can never become valid are replaced with U+FFFD.
#[derive(Clone, Default, Debug)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buffer;
        let bytes = if self.pending.is_empty() {
            bytes
        } else {
            buffer = std::mem::take(&mut self.pending);
            buffer.extend_from_slice(bytes);
            &buffer[..]
        };

        let mut text = String::with_capacity(bytes.len());
        let mut chunks = bytes.utf8_chunks().peekable();
        while let Some(chunk) = chunks.next() {
            text.push_str(chunk.valid());
            let invalid = chunk.invalid();
            if invalid.is_empty() {
                continue;
            }
            // Only the tail of the input may be an unfinished character.
            if chunks.peek().is_none() && is_incomplete(invalid) {
                self.pending.extend_from_slice(invalid);
            } else {
                text.push(char::REPLACEMENT_CHARACTER);
            }
        }
        text
    }

    /// Flushes bytes still waiting for the rest of their character.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Whether `bytes` is a proper prefix of some multi-byte character.
fn is_incomplete(bytes: &[u8]) -> bool {
    let expected = match bytes[0] {
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => return false,
    };
    bytes.len() < expected && bytes[1..].iter().all(|b| b & 0xc0 == 0x80)
}
