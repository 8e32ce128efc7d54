//! Error types for the server, its sessions and the relay.

use std::io;

use thiserror::Error;

use crate::{client::ClientError, relay::dns::DnsError};

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

/// Errors that can occur while reading from or writing to a client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by peer, or is mid upgrade.
    #[error("Connection closed by peer")]
    Closed,

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
}

impl ConnectionError {
    /// Resets and broken pipes are how clients usually hang up.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS error: {0}")]
    Rustls(String),

    #[error("TLS is not configured")]
    NotConfigured,
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Rejections from [`Registry::add_handler`](crate::smtp::registry::Registry::add_handler).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Handlers must be registered for a named event")]
    EmptyEvent,

    #[error("Handlers registered for '{0}' must have a name")]
    EmptyName(String),
}

/// Errors raised while queueing or delivering relayed mail.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid queue record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    Delivery { message: String, permanent: bool },

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

impl RelayError {
    /// Permanent failures are bounced instead of retried.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::InvalidEnvelope(_) => true,
            Self::Delivery { permanent, .. } => *permanent,
            Self::Client(err) => err.code().is_some_and(|code| code >= 500),
            Self::Io(_) | Self::Json(_) | Self::Dns(_) => false,
        }
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

pub type TlsResult<T> = Result<T, TlsError>;

pub type SessionResult<T> = Result<T, SessionError>;
