//! Chunk-level text decoding and line-ending normalization.

/// Incremental UTF-8 decoder. A multi-byte sequence split across two reads
/// is held back until the rest arrives; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes.
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is left at end-of-stream.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Folds `\r` into `\n` and collapses consecutive line feeds into one.
/// State carries across chunks so a `\r\n` split between reads still
/// yields a single line feed.
#[derive(Debug, Default)]
pub struct LineNormalizer {
    last_was_lf: bool,
}

impl LineNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last_was_lf = false;
    }

    pub fn normalize(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        for c in chunk.chars() {
            let c = if c == '\r' { '\n' } else { c };
            if c == '\n' {
                if self.last_was_lf {
                    continue;
                }
                self.last_was_lf = true;
            } else {
                self.last_was_lf = false;
            }
            out.push(c);
        }
        out
    }
}
