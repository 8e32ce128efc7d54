use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered with a 4xx or 5xx code.
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u32, message: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid message: {0}")]
    BuilderError(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The named step did not complete in time.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// The server's reply code, when the failure was a reply.
    #[must_use]
    pub const fn code(&self) -> Option<u32> {
        match self {
            Self::SmtpError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
