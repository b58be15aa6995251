//! Streaming HTTP/1.x response parser.
//!
//! Bytes arrive in whatever pieces the socket delivers. Every line of the
//! header block (status line and terminating blank line included) is
//! forwarded to the transfer's sink as soon as it is complete, and body
//! bytes are forwarded as they are decoded. Interim `1xx` responses are
//! passed through and then skipped; the parser waits for the final head.

use netq_core::parse_header_line;

use super::{TransferError, TransferSink};

/// Longest accepted header line.
const MAX_LINE: usize = 64 * 1024;

/// Final outcome of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Finished {
    pub status: u16,
    pub content_type: Option<String>,
    /// The connection can carry another request.
    pub reusable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Length(u64),
    Chunked(Chunk),
    UntilClose,
    Done,
}

#[derive(Debug)]
pub(crate) struct ResponseParser {
    state: State,
    line: Vec<u8>,
    received: u64,
    status: u16,
    http10: bool,
    content_length: Option<u64>,
    chunked: bool,
    close: bool,
    keep_alive: bool,
    content_type: Option<String>,
    trailing_garbage: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::StatusLine,
            line: Vec::new(),
            received: 0,
            status: 0,
            http10: false,
            content_length: None,
            chunked: false,
            close: false,
            keep_alive: false,
            content_type: None,
            trailing_garbage: false,
        }
    }

    /// True once any response byte has been seen.
    pub fn started(&self) -> bool {
        self.received > 0
    }

    /// Feed received bytes. Returns the outcome once the response is complete.
    pub fn feed<S: TransferSink>(
        &mut self,
        mut data: &[u8],
        sink: &mut S,
    ) -> Result<Option<Finished>, TransferError> {
        self.received += data.len() as u64;

        while !data.is_empty() {
            match self.state {
                State::StatusLine | State::Headers => {
                    let Some(line) = self.take_line(&mut data)? else {
                        break;
                    };
                    sink.header_line(&line);
                    self.head_line(&line)?;
                }
                State::Length(remaining) => {
                    let n = remaining.min(data.len() as u64) as usize;
                    sink.body_chunk(&data[..n]);
                    data = &data[n..];
                    let left = remaining - n as u64;
                    self.state = if left == 0 { State::Done } else { State::Length(left) };
                }
                State::UntilClose => {
                    sink.body_chunk(data);
                    data = &[];
                }
                State::Chunked(Chunk::Data(remaining)) => {
                    let n = remaining.min(data.len() as u64) as usize;
                    sink.body_chunk(&data[..n]);
                    data = &data[n..];
                    let left = remaining - n as u64;
                    self.state = State::Chunked(if left == 0 {
                        Chunk::DataEnd
                    } else {
                        Chunk::Data(left)
                    });
                }
                State::Chunked(chunk) => {
                    let Some(line) = self.take_line(&mut data)? else {
                        break;
                    };
                    self.chunk_line(chunk, &line)?;
                }
                State::Done => {
                    self.trailing_garbage = true;
                    break;
                }
            }
        }

        Ok(self.finished())
    }

    /// The peer closed the connection.
    pub fn finish_eof(&mut self) -> Result<Finished, TransferError> {
        match self.state {
            State::UntilClose => {
                self.state = State::Done;
                self.close = true;
                Ok(self.outcome())
            }
            State::Done => Ok(self.outcome()),
            State::StatusLine if self.received == 0 => Err(TransferError::GotNothing),
            State::StatusLine | State::Headers => Err(TransferError::Recv),
            State::Length(_) | State::Chunked(_) => Err(TransferError::PartialFile),
        }
    }

    fn finished(&self) -> Option<Finished> {
        (self.state == State::Done).then(|| self.outcome())
    }

    fn outcome(&self) -> Finished {
        let persistent = if self.http10 { self.keep_alive } else { true };
        Finished {
            status: self.status,
            content_type: self.content_type.clone(),
            reusable: persistent && !self.close && !self.trailing_garbage,
        }
    }

    /// Move one complete line (with its `\n`) out of `data`.
    fn take_line(&mut self, data: &mut &[u8]) -> Result<Option<Vec<u8>>, TransferError> {
        match data.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.line.extend_from_slice(&data[..=i]);
                *data = &data[i + 1..];
                Ok(Some(std::mem::take(&mut self.line)))
            }
            None => {
                self.line.extend_from_slice(data);
                *data = &[];
                if self.line.len() > MAX_LINE {
                    return Err(TransferError::WeirdReply);
                }
                Ok(None)
            }
        }
    }

    fn head_line(&mut self, line: &[u8]) -> Result<(), TransferError> {
        if self.state == State::StatusLine {
            return self.status_line(line);
        }

        if line == b"\r\n" || line == b"\n" {
            return self.end_of_head();
        }

        // Lines the framing logic cannot read are ignored here; the sink
        // decides separately whether to record them.
        if let Ok(Some((name, value))) = parse_header_line(line) {
            if name.eq_ignore_ascii_case("content-length") {
                let length = value
                    .parse::<u64>()
                    .map_err(|_| TransferError::WeirdReply)?;
                if self.content_length.is_some_and(|l| l != length) {
                    return Err(TransferError::WeirdReply);
                }
                self.content_length = Some(length);
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                self.chunked = value
                    .rsplit(',')
                    .next()
                    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
            } else if name.eq_ignore_ascii_case("connection") {
                for token in value.split(',').map(str::trim) {
                    if token.eq_ignore_ascii_case("close") {
                        self.close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        self.keep_alive = true;
                    }
                }
            } else if name.eq_ignore_ascii_case("content-type") {
                self.content_type = Some(value);
            }
        }
        Ok(())
    }

    fn status_line(&mut self, line: &[u8]) -> Result<(), TransferError> {
        let text = std::str::from_utf8(line).map_err(|_| TransferError::WeirdReply)?;
        let mut parts = text.trim_end().splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(TransferError::WeirdReply);
        }
        let code = parts.next().unwrap_or_default();
        if code.len() != 3 {
            return Err(TransferError::WeirdReply);
        }
        self.status = code.parse().map_err(|_| TransferError::WeirdReply)?;
        self.http10 = version == "HTTP/1.0";
        self.state = State::Headers;
        Ok(())
    }

    fn end_of_head(&mut self) -> Result<(), TransferError> {
        if (100..200).contains(&self.status) && self.status != 101 {
            // Interim response; the final head follows.
            self.reset_head();
            return Ok(());
        }

        self.state = if matches!(self.status, 101 | 204 | 304) {
            State::Done
        } else if self.chunked {
            State::Chunked(Chunk::Size)
        } else if let Some(length) = self.content_length {
            if length == 0 {
                State::Done
            } else {
                State::Length(length)
            }
        } else {
            self.close = true;
            State::UntilClose
        };
        Ok(())
    }

    fn reset_head(&mut self) {
        self.state = State::StatusLine;
        self.status = 0;
        self.content_length = None;
        self.chunked = false;
        self.close = false;
        self.keep_alive = false;
        self.content_type = None;
    }

    fn chunk_line(&mut self, chunk: Chunk, line: &[u8]) -> Result<(), TransferError> {
        let text = std::str::from_utf8(line).map_err(|_| TransferError::WeirdReply)?;
        let text = text.trim_end_matches(['\r', '\n']);
        match chunk {
            Chunk::Size => {
                let size = text.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size, 16).map_err(|_| TransferError::WeirdReply)?;
                self.state = State::Chunked(if size == 0 {
                    Chunk::Trailer
                } else {
                    Chunk::Data(size)
                });
            }
            Chunk::DataEnd => {
                if !text.is_empty() {
                    return Err(TransferError::WeirdReply);
                }
                self.state = State::Chunked(Chunk::Size);
            }
            Chunk::Trailer => {
                if text.is_empty() {
                    self.state = State::Done;
                }
            }
            Chunk::Data(_) => unreachable!("chunk data is consumed without line framing"),
        }
        Ok(())
    }
}
