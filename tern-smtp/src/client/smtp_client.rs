use std::time::Duration;

use tern_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Prepare a message body for the DATA phase: lines starting with `.` get
/// another `.`, bare `\n` becomes CRLF, and the result ends in CRLF.
#[must_use]
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    let mut at_line_start = true;
    let mut previous = 0u8;

    for &byte in body {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);

        at_line_start = byte == b'\n';
        previous = byte;
    }

    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }

    out
}

/// An SMTP client for sending commands and receiving responses.
#[derive(Debug)]
pub struct SmtpClient {
    stream: TcpStream,
    buffer: Vec<u8>,
    buffer_pos: usize,
    read_timeout: Duration,
}

impl SmtpClient {
    /// Connects to `addr`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out.
    pub async fn connect_timeout(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_secs(), "connecting"))??;

        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            read_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound every subsequent reply read by `timeout`.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub const fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Reads the initial server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is invalid.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command line to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");
        self.stream
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        Ok(())
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the dot-stuffed body followed by the terminating `.` line and
    /// reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn send_data(&mut self, body: &[u8]) -> Result<Response> {
        outgoing!("<{} bytes of message data>", body.len());

        let mut payload = dot_stuff(body);
        payload.extend_from_slice(b".\r\n");
        self.stream.write_all(&payload).await?;

        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Reads a complete SMTP response within the read timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails, times out or the response is
    /// malformed.
    pub async fn read_response(&mut self) -> Result<Response> {
        let timeout = self.read_timeout;
        let response = tokio::time::timeout(timeout, self.read_response_inner())
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_secs(), "waiting for a reply"))??;

        for line in &response.lines {
            incoming!("{} {line}", response.code);
        }

        Ok(response)
    }

    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    async fn read_response_inner(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let read = self.stream.read(&mut self.buffer[self.buffer_pos..]).await?;
            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.buffer_pos += read;
        }
    }
}
