//! SMTP reply parsing.

use super::error::{ClientError, Result};

/// One line of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `false` when the code is followed by `-` and more lines follow.
    pub is_last: bool,
    pub message: String,
}

/// A complete reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// Parses a single response line (without its terminator).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let Some(code) = line.get(..3) else {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        };

        let code = code
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(&other) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(other)
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it used, or `None` when
    /// the buffer does not yet hold a final line.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the response is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut consumed = 0;

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(std::str::from_utf8(raw)?)?;

            match code {
                Some(expected) if expected != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Some((Self::new(parsed.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        assert_eq!(
            Response::parse_line("220 mail.example.com ESMTP").unwrap(),
            ResponseLine {
                code: 220,
                is_last: true,
                message: "mail.example.com ESMTP".to_string(),
            }
        );
        assert_eq!(Response::parse_line("334 ").unwrap().message, "");
        assert!(Response::parse_line("334").unwrap().is_last);
    }

    #[test]
    fn malformed_lines() {
        assert!(Response::parse_line("25").is_err());
        assert!(Response::parse_line("abc OK").is_err());
        assert!(Response::parse_line("250+OK").is_err());
    }

    #[test]
    fn multi_line() {
        let data = b"250-mx.example.com\r\n250-SIZE 1024\r\n250 SMTPUTF8\r\n354 next";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();

        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["mx.example.com", "SIZE 1024", "SMTPUTF8"]);
        assert_eq!(consumed, data.len() - "354 next".len());
    }

    #[test]
    fn incomplete() {
        assert!(Response::parse_response(b"250-mx\r\n250-SI").unwrap().is_none());
        assert!(Response::parse_response(b"").unwrap().is_none());
    }

    #[test]
    fn mismatched_codes() {
        assert!(Response::parse_response(b"250-a\r\n251 b\r\n").is_err());
    }
}
