//! Incremental HTTP/1.1 response parser.
//!
//! The transport delivers packets as the kernel produces them, so the parser
//! must survive any packetization: bytes accumulate in an internal buffer
//! and `parse()` consumes whatever prefixes are complete, carrying its state
//! (status line → headers → body) across calls. Body framing is
//! Content-Length or chunked transfer encoding; with neither, the message
//! ends at the blank line.

use bytes::BytesMut;

use crate::error::Error;
use crate::response::Response;

/// Result of a parse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// More input is needed before the message completes.
    NeedMore,
    /// A full response is buffered; take it with
    /// [`ResponseParser::take_response`].
    Done,
}

enum Phase {
    StatusLine,
    Headers,
    BodyLength { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkDataEnd,
    Done,
}

/// Packetization-tolerant response parser.
pub struct ResponseParser {
    buf: BytesMut,
    phase: Phase,
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    chunked: bool,
    body: BytesMut,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> ResponseParser {
        ResponseParser {
            buf: BytesMut::new(),
            phase: Phase::StatusLine,
            status: 0,
            headers: Vec::new(),
            content_length: None,
            chunked: false,
            body: BytesMut::new(),
        }
    }

    /// Append raw bytes from the wire.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Consume as much buffered input as possible.
    pub fn parse(&mut self) -> Result<ParseState, Error> {
        loop {
            match self.phase {
                Phase::StatusLine => {
                    // Tolerate stray CRLFs between messages.
                    while self.buf.starts_with(b"\r\n") {
                        let _ = self.buf.split_to(2);
                    }
                    let end = match find_crlf(&self.buf) {
                        Some(end) => end,
                        None => return Ok(ParseState::NeedMore),
                    };
                    let line = self.buf.split_to(end + 2);
                    self.status = parse_status_line(&line[..end])?;
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let end = match find_crlf(&self.buf) {
                        Some(end) => end,
                        None => return Ok(ParseState::NeedMore),
                    };
                    if end == 0 {
                        // Blank line: headers are complete.
                        let _ = self.buf.split_to(2);
                        self.phase = self.body_phase()?;
                        continue;
                    }
                    let line = self.buf.split_to(end + 2);
                    self.parse_header_line(&line[..end])?;
                }
                Phase::BodyLength { remaining } => {
                    let take = remaining.min(self.buf.len());
                    if take == 0 {
                        return Ok(ParseState::NeedMore);
                    }
                    let chunk = self.buf.split_to(take);
                    self.body.extend_from_slice(&chunk);
                    if take == remaining {
                        self.phase = Phase::Done;
                        return Ok(ParseState::Done);
                    }
                    self.phase = Phase::BodyLength {
                        remaining: remaining - take,
                    };
                    return Ok(ParseState::NeedMore);
                }
                Phase::ChunkSize => {
                    let end = match find_crlf(&self.buf) {
                        Some(end) => end,
                        None => return Ok(ParseState::NeedMore),
                    };
                    let line = self.buf.split_to(end + 2);
                    let size = parse_chunk_size(&line[..end])?;
                    if size == 0 {
                        // Terminal chunk. A trailing CRLF, if the peer sends
                        // one, is skipped by the next status-line phase.
                        self.phase = Phase::Done;
                        return Ok(ParseState::Done);
                    }
                    self.phase = Phase::ChunkData { remaining: size };
                }
                Phase::ChunkData { remaining } => {
                    let take = remaining.min(self.buf.len());
                    if take == 0 {
                        return Ok(ParseState::NeedMore);
                    }
                    let chunk = self.buf.split_to(take);
                    self.body.extend_from_slice(&chunk);
                    if take == remaining {
                        self.phase = Phase::ChunkDataEnd;
                    } else {
                        self.phase = Phase::ChunkData {
                            remaining: remaining - take,
                        };
                        return Ok(ParseState::NeedMore);
                    }
                }
                Phase::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(ParseState::NeedMore);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(Error::Parse("chunk data not CRLF-terminated".into()));
                    }
                    let _ = self.buf.split_to(2);
                    self.phase = Phase::ChunkSize;
                }
                Phase::Done => return Ok(ParseState::Done),
            }
        }
    }

    /// Move the parsed response out. Call once per `Done`.
    pub fn take_response(&mut self) -> Response {
        Response::new(
            self.status,
            std::mem::take(&mut self.headers),
            self.body.split().freeze(),
        )
    }

    /// Drop all state including unconsumed input. For socket teardown —
    /// bytes from a dead connection must not bleed into the next one.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.reset();
    }

    /// Prepare for the next message. Unconsumed input is retained.
    pub fn reset(&mut self) {
        self.phase = Phase::StatusLine;
        self.status = 0;
        self.headers.clear();
        self.content_length = None;
        self.chunked = false;
        self.body.clear();
    }

    fn body_phase(&self) -> Result<Phase, Error> {
        if self.chunked {
            return Ok(Phase::ChunkSize);
        }
        match self.content_length {
            Some(0) | None => Ok(Phase::Done),
            Some(n) => Ok(Phase::BodyLength { remaining: n }),
        }
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(line)
            .map_err(|_| Error::Parse("header line is not valid UTF-8".into()))?;
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| Error::Parse("header line has no colon".into()))?;
        let name = name.trim().to_string();
        let value = value.trim().to_string();

        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .parse()
                .map_err(|_| Error::Parse("invalid Content-Length".into()))?;
            self.content_length = Some(len);
        }
        if name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked")
        {
            self.chunked = true;
        }

        self.headers.push((name, value));
        Ok(())
    }
}

/// Find the position of the first `\r\n`.
fn find_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}

/// Parse `HTTP/1.1 200 OK` into the status code.
fn parse_status_line(line: &[u8]) -> Result<u16, Error> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::Parse("status line is not valid UTF-8".into()))?;
    let mut parts = text.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| Error::Parse("empty status line".into()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(Error::Parse(format!("unexpected version {version:?}")));
    }
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse("invalid status code".into()))
}

/// Parse a chunk-size line, stripping chunk extensions (`;key=value`).
fn parse_chunk_size(line: &[u8]) -> Result<usize, Error> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::Parse("chunk size line is not valid UTF-8".into()))?;
    let size_hex = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_hex, 16).map_err(|_| Error::Parse("invalid chunk size".into()))
}
