//! Content-Length framing.
//!
//! A frame is an ASCII header block terminated by an empty line, followed by
//! exactly `Content-Length` body bytes:
//!
//! ```text
//! Content-Length: 43\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"version"}
//! ```
//!
//! Header names are case-insensitive; headers other than `Content-Length`
//! are ignored.

use std::io::{BufRead, Read, Write};

use crate::error::FrameError;

const CONTENT_LENGTH: &str = "content-length";

/// Default upper bound on a single frame body
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Longest header line accepted, terminator included
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Parsed header block
#[derive(Default)]
struct Headers {
    content_length: Option<Result<u64, FrameError>>,
    malformed: Option<FrameError>,
}

/// Reads Content-Length framed bodies from a buffered byte stream
pub struct FrameReader<R> {
    reader: R,
    max_message_size: usize,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Reject bodies longer than `limit` bytes
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next frame body.
    ///
    /// A malformed header block is consumed up to its terminating empty line
    /// before the error is returned, along with the body when its length is
    /// known, so the caller can keep reading. Oversized bodies are skipped
    /// without being buffered.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        let headers = self.read_headers()?;
        let declared = match headers.content_length {
            Some(Ok(length)) => length,
            Some(Err(e)) => return Err(headers.malformed.unwrap_or(e)),
            None => {
                return Err(headers
                    .malformed
                    .unwrap_or(FrameError::MissingContentLength));
            }
        };

        let expected = match usize::try_from(declared) {
            Ok(length) if length <= self.max_message_size => length,
            _ => {
                self.discard(declared)?;
                return Err(FrameError::MessageTooLarge {
                    length: declared,
                    limit: self.max_message_size,
                });
            }
        };
        if let Some(error) = headers.malformed {
            self.discard(declared)?;
            return Err(error);
        }

        let mut body = Vec::new();
        let read = (&mut self.reader).take(declared).read_to_end(&mut body)?;
        if read < expected {
            return Err(FrameError::TruncatedBody { expected, read });
        }
        Ok(body)
    }

    fn read_headers(&mut self) -> Result<Headers, FrameError> {
        let mut headers = Headers::default();
        let mut seen_header = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = (&mut self.reader)
                .take(MAX_HEADER_LINE as u64)
                .read_until(b'\n', &mut line)?;
            if read == 0 {
                return Err(FrameError::EndOfStream);
            }
            if read == MAX_HEADER_LINE && !line.ends_with(b"\n") {
                self.discard_line()?;
                seen_header = true;
                headers
                    .malformed
                    .get_or_insert(FrameError::HeaderTooLong(MAX_HEADER_LINE));
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                // blank lines between frames are skipped
                if !seen_header {
                    continue;
                }
                break;
            }
            seen_header = true;

            let Some((name, value)) = trimmed.split_once(':') else {
                headers
                    .malformed
                    .get_or_insert(FrameError::MalformedHeader(trimmed.to_string()));
                continue;
            };

            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let value = value.trim();
                headers.content_length = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| FrameError::InvalidContentLength(value.to_string())),
                );
            }
        }

        Ok(headers)
    }

    /// Drop up to `length` bytes without buffering them
    fn discard(&mut self, length: u64) -> Result<(), FrameError> {
        std::io::copy(&mut (&mut self.reader).take(length), &mut std::io::sink())?;
        Ok(())
    }

    /// Drop the rest of the current line
    fn discard_line(&mut self) -> Result<(), FrameError> {
        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    self.reader.consume(end + 1);
                    return Ok(());
                }
                None => {
                    let len = buf.len();
                    self.reader.consume(len);
                }
            }
        }
    }
}

/// Writes Content-Length framed bodies
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write header and body, then flush
    pub fn write_frame(&mut self, body: &[u8]) -> std::io::Result<()> {
        write!(self.writer, "Content-Length: {}\r\n\r\n", body.len())?;
        self.writer.write_all(body)?;
        self.writer.flush()
    }
}
