//! Newline-delimited framing that keeps going after bad input.
//!
//! [`tokio_util::codec::LinesCodec`] fails the whole stream on a line that is not UTF-8 or is too
//! long, and a `Framed` stream ends after its first error.  A JSON-RPC peer is expected to answer
//! such lines with a parse error and carry on, so this codec hands them up as
//! [`LineFrame::Malformed`] instead and only fails on real I/O errors.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One line read by [`JsonLinesCodec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFrame {
    Text(String),
    /// A line that could not be decoded, and why
    Malformed(String),
}

/// Frames a byte stream as lines of UTF-8 text separated by `\n` (a trailing `\r` is dropped).
#[derive(Debug, Clone)]
pub struct JsonLinesCodec {
    max_length: usize,
    /// Index into the buffer up to which we already know there is no newline
    next_index: usize,
    /// Skipping the rest of an over-long line that was already reported
    discarding: bool,
}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self {
            max_length: usize::MAX,
            next_index: 0,
            discarding: false,
        }
    }

    /// Lines longer than `max_length` bytes are reported as malformed and skipped
    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            ..Self::new()
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(line: &[u8]) -> LineFrame {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    match std::str::from_utf8(line) {
        Ok(text) => LineFrame::Text(text.to_string()),
        Err(e) => LineFrame::Malformed(format!("invalid UTF-8: {e}")),
    }
}

impl Decoder for JsonLinesCodec {
    type Item = LineFrame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<LineFrame>, std::io::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(newline_index)) => {
                    buf.advance(newline_index + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(newline_index)) => {
                    self.next_index = 0;
                    let line = buf.split_to(newline_index + 1);
                    return Ok(Some(decode_line(&line[..newline_index])));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    return Ok(Some(LineFrame::Malformed(format!(
                        "line exceeds {} bytes",
                        self.max_length
                    ))));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<LineFrame>, std::io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }

        // The last line had no newline
        let line = buf.split_to(buf.len());
        Ok(Some(decode_line(&line)))
    }
}

impl<T: AsRef<str>> Encoder<T> for JsonLinesCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: T, buf: &mut BytesMut) -> Result<(), std::io::Error> {
        let line = line.as_ref();
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(())
    }
}
