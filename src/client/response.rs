//! SMTP reply parsing.

use super::error::{ClientError, Result};
use crate::status::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u32,
    /// `false` for `-` continuation lines.
    pub is_last: bool,
    pub message: String,
}

/// A complete, possibly multi-line, reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u32,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u32, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub fn status(&self) -> Status {
        Status::from(self.code)
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 2xx, or 3xx asking for more input.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Whether an EHLO reply lists `extension`.
    #[must_use]
    pub fn has_extension(&self, extension: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// Turns a negative reply into [`ClientError::SmtpError`].
    ///
    /// # Errors
    ///
    /// If the reply is neither 2xx nor 3xx.
    pub fn ensure_positive(self) -> Result<Self> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(ClientError::SmtpError {
                code: self.code,
                message: self.message(),
            })
        }
    }

    /// # Errors
    ///
    /// If the line does not start with a three digit code followed by a
    /// space, a dash or nothing.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let code = line
            .get(..3)
            .filter(|code| code.bytes().all(|byte| byte.is_ascii_digit()))
            .ok_or_else(|| ClientError::ParseError(format!("Invalid status code: '{line}'")))?
            .parse::<u32>()
            .map_err(|err| ClientError::ParseError(err.to_string()))?;

        let is_last = match line[3..].chars().next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(separator) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{separator}'"
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses one complete reply from the front of `buffer`, returning it
    /// with the number of bytes it used. `None` when more data is needed.
    ///
    /// # Errors
    ///
    /// If a line is malformed or a continuation changes the code.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&byte| byte == b'\n') {
            let raw = std::str::from_utf8(&buffer[consumed..consumed + end])?;
            consumed += end + 1;

            let raw = raw.trim_end_matches('\r');
            if raw.is_empty() {
                continue;
            }

            let line = Self::parse_line(raw)?;
            match code {
                Some(code) if code != line.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        line.code
                    )));
                }
                _ => code = Some(line.code),
            }

            lines.push(line.message);

            if line.is_last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}
