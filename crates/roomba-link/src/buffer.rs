//! Fixed-capacity receive buffer for the serial link.
//!
//! Bytes arrive in arbitrary chunks.  [`ByteStreamBuffer`] keeps them in a
//! single contiguous region `[start, end)` so a whole response can be
//! handed to the decoder as one slice.
//!
//! # Capacity rules
//!
//! | Situation | Action |
//! |---|---|
//! | `start == end` | both indices reset to 0 |
//! | chunk does not fit after `end` | valid bytes are moved to index 0 first |
//! | chunk still does not fit | unconsumed data is discarded |
//! | chunk larger than the buffer | only its newest `capacity` bytes are kept |

use tracing::warn;

/// Default capacity of the receive buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct ByteStreamBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl ByteStreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// The unconsumed bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Append a chunk read from the link.
    ///
    /// Returns how many previously buffered or incoming bytes had to be
    /// dropped to make room.
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        let capacity = self.capacity();
        let mut dropped = 0;

        if chunk.len() > capacity - self.end {
            self.compact();
        }
        if chunk.len() > capacity - self.end {
            dropped += self.len();
            warn!(
                discarded = self.len(),
                incoming = chunk.len(),
                "receive buffer overflow, discarding unconsumed data"
            );
            self.start = 0;
            self.end = 0;
        }

        let chunk = if chunk.len() > capacity {
            dropped += chunk.len() - capacity;
            &chunk[chunk.len() - capacity..]
        } else {
            chunk
        };

        self.data[self.end..self.end + chunk.len()].copy_from_slice(chunk);
        self.end += chunk.len();
        dropped
    }

    /// Mark `n` bytes at the head as consumed.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Drop everything; used when resynchronizing with the robot.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Skip printable text lines the robot emits on its own.
    ///
    /// The robot prints banners such as `bl-start\r\n` when it boots or is
    /// charging.  A line of printable ASCII (`0x20..0x7F`) terminated by
    /// CR LF is consumed.  Scanning stops at the first byte that cannot
    /// belong to such a line.  Returns the number of bytes skipped.
    pub fn skip_unrequested_text(&mut self) -> usize {
        let mut skipped = 0;
        while let Some(line_len) = self.leading_text_line() {
            self.consume(line_len);
            skipped += line_len;
        }
        skipped
    }

    /// Length of a complete text line at the head of the buffer, if any.
    fn leading_text_line(&self) -> Option<usize> {
        let bytes = self.as_slice();
        let mut text = 0usize;
        let mut saw_cr = false;
        let mut line_end = false;

        for (ix, &b) in bytes.iter().enumerate() {
            match b {
                b'\r' => saw_cr = true,
                b'\n' if saw_cr => line_end = true,
                b'\n' => return None,
                _ if line_end && text > 0 => return Some(ix),
                0x20..=0x7F => {
                    text += 1;
                    line_end = false;
                }
                _ => return None,
            }
        }
        (line_end && text > 0).then_some(bytes.len())
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

impl Default for ByteStreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
