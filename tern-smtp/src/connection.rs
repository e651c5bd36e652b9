use std::fmt::Display;

use tern_common::tracing;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ConnectionError, ConnectionResult};

/// Size of the internal read buffer.
const BUFFER_SIZE: usize = 8192;

/// Longest line accepted from a peer, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A line-oriented wrapper around a byte stream.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    stream: Stream,
    /// Internal read buffer to reduce syscalls
    read_buf: Box<[u8]>,
    /// Current position in read buffer
    read_pos: usize,
    /// Amount of valid data in read buffer
    read_len: usize,
    /// Bytes of the line being assembled
    line: Vec<u8>,
    /// Set after an over-long line until its terminator has been skipped
    discarding: bool,
    max_line: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self::with_max_line(stream, MAX_LINE_LENGTH)
    }

    pub fn with_max_line(stream: Stream, max_line: usize) -> Self {
        Self {
            stream,
            read_buf: vec![0; BUFFER_SIZE].into_boxed_slice(),
            read_pos: 0,
            read_len: 0,
            line: Vec::new(),
            discarding: false,
            max_line,
        }
    }

    /// Write `response` followed by CRLF.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn send<S: Display + Send + Sync>(&mut self, response: &S) -> ConnectionResult<usize> {
        let buffer = format!("{response}\r\n");
        self.stream.write_all(buffer.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(buffer.len())
    }

    /// Read the next line with its `\r\n` (or bare `\n`) removed.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream and nothing is
    /// left. An unterminated trailing fragment is returned as a line. A line
    /// longer than the limit yields [`ConnectionError::LineTooLong`]; the
    /// rest of it is skipped so the next call starts on a fresh line.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn read_line(&mut self) -> ConnectionResult<Option<Vec<u8>>> {
        loop {
            if self.read_pos < self.read_len {
                let available = &self.read_buf[self.read_pos..self.read_len];

                if let Some(end) = available.iter().position(|&b| b == b'\n') {
                    self.read_pos += end + 1;

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }

                    self.line.extend_from_slice(&available[..end]);
                    if self.line.len() > self.max_line + 1 {
                        self.line.clear();
                        return Err(ConnectionError::LineTooLong(self.max_line));
                    }

                    let mut line = std::mem::take(&mut self.line);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }

                if !self.discarding {
                    self.line.extend_from_slice(available);
                }
                self.read_pos = self.read_len;

                if self.line.len() > self.max_line + 1 {
                    self.line.clear();
                    self.discarding = true;
                    return Err(ConnectionError::LineTooLong(self.max_line));
                }
            }

            let read = self.stream.read(&mut self.read_buf).await?;
            self.read_pos = 0;
            self.read_len = read;

            if read == 0 {
                self.discarding = false;
                return Ok((!self.line.is_empty()).then(|| std::mem::take(&mut self.line)));
            }
        }
    }
}
