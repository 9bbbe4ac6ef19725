//! Incremental splitting of streamed JSON objects.
//!
//! A streamed generate response is a sequence of JSON objects, separated by newlines, that
//! arrives in arbitrarily sized byte chunks. [`StreamDecoder`] buffers those chunks and hands
//! out each object as soon as its closing brace has been seen.

/// Position of the scanner relative to the object being scanned.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Between objects, skipping whitespace.
    Between,
    /// Inside an object, `depth` braces deep.
    Object { depth: usize },
    /// Inside a string literal of an object `depth` braces deep.
    Text { depth: usize, escaped: bool },
}

#[derive(Debug, PartialEq)]
pub enum ScanResult {
    NeedsMore,
    Error,
    /// Split point in the input slice, one past the closing brace.
    Found(usize),
}

/// Brace-matching scanner that finds the end of a single top-level JSON object.
///
/// The scanner keeps its state between calls, so input may be fed piecewise. Each byte must be
/// fed exactly once.
#[derive(Debug)]
pub struct JsonScanner {
    state: ScanState,
}

impl Default for JsonScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Between,
        }
    }

    pub fn scan(&mut self, input: &[u8]) -> ScanResult {
        for (i, &byte) in input.iter().enumerate() {
            self.state = match (self.state, byte) {
                (ScanState::Between, b'{') => ScanState::Object { depth: 1 },
                (ScanState::Between, b) if b.is_ascii_whitespace() => ScanState::Between,
                (ScanState::Between, _) => return ScanResult::Error,

                (ScanState::Object { depth: 1 }, b'}') => {
                    self.state = ScanState::Between;
                    return ScanResult::Found(i + 1);
                }
                (ScanState::Object { depth }, b'}') => ScanState::Object { depth: depth - 1 },
                (ScanState::Object { depth }, b'{') => ScanState::Object { depth: depth + 1 },
                (ScanState::Object { depth }, b'"') => ScanState::Text {
                    depth,
                    escaped: false,
                },
                (state @ ScanState::Object { .. }, _) => state,

                (ScanState::Text { depth, escaped: true }, _) => ScanState::Text {
                    depth,
                    escaped: false,
                },
                (ScanState::Text { depth, .. }, b'\\') => ScanState::Text {
                    depth,
                    escaped: true,
                },
                (ScanState::Text { depth, .. }, b'"') => ScanState::Object { depth },
                (state @ ScanState::Text { .. }, _) => state,
            };
        }

        ScanResult::NeedsMore
    }

    /// Whether the scanner is between objects.
    pub fn is_idle(&self) -> bool {
        self.state == ScanState::Between
    }
}

/// Error returned when the stream contains something other than JSON objects.
#[derive(Debug, thiserror::Error)]
#[error("unexpected data in response stream at byte {offset}")]
pub struct StreamError {
    pub offset: usize,
}

/// Buffers a byte stream and yields the complete JSON objects it contains.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already fed to the scanner.
    scanned: usize,
    /// Bytes already removed from the front of `buffer`, for error reporting.
    consumed: usize,
    scanner: JsonScanner,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of input and returns every object completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, StreamError> {
        self.buffer.extend_from_slice(chunk);

        let mut objects = Vec::new();
        loop {
            if self.scanner.is_idle() {
                let whitespace = self
                    .buffer
                    .iter()
                    .take_while(|byte| byte.is_ascii_whitespace())
                    .count();
                self.buffer.drain(..whitespace);
                self.consumed += whitespace;
                self.scanned = 0;
            }

            match self.scanner.scan(&self.buffer[self.scanned..]) {
                ScanResult::Found(len) => {
                    let end = self.scanned + len;
                    objects.push(self.buffer.drain(..end).collect());
                    self.consumed += end;
                    self.scanned = 0;
                }
                ScanResult::NeedsMore => {
                    self.scanned = self.buffer.len();
                    return Ok(objects);
                }
                ScanResult::Error => {
                    return Err(StreamError {
                        offset: self.consumed + self.scanned,
                    });
                }
            }
        }
    }

    /// Whether the stream ended cleanly, outside of any object.
    pub fn is_finished(&self) -> bool {
        self.scanner.is_idle()
    }
}
