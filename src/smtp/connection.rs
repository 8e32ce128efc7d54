use std::{
    fmt::Display,
    fs::File,
    io::BufReader as StdBufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig, ServerConnection,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::{
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
    internal,
};

const BUFFER_SIZE: usize = 8192;

/// Certificate chain and private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsContext {
    fn load_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut StdBufReader::new(File::open(path)?)).collect()
    }

    fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
        let key_error = |reason: String| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason,
        };

        let mut reader = StdBufReader::new(File::open(path).map_err(|e| key_error(e.to_string()))?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| key_error(e.to_string()))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(key_error(String::from(
                "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)",
            ))),
        }
    }

    /// Loads the certificate and key once, for every connection to share.
    ///
    /// # Errors
    ///
    /// If either file is missing or unreadable, or rustls rejects the pair.
    pub fn acceptor(&self) -> TlsResult<TlsAcceptor> {
        let certs = Self::load_certs(&self.certificate).map_err(|source| TlsError::CertificateLoad {
            path: self.certificate.display().to_string(),
            source,
        })?;
        let key = Self::load_key(&self.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Negotiated protocol and cipher suite, for logging.
#[derive(Debug, Default, Clone)]
pub struct TlsInfo {
    pub version: Option<String>,
    pub cipher: Option<String>,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn
                .protocol_version()
                .and_then(|version| version.as_str())
                .map(str::to_string),
            cipher: conn
                .negotiated_cipher_suite()
                .and_then(|suite| suite.suite().as_str())
                .map(str::to_string),
        }
    }
}

impl Display for TlsInfo {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            fmt,
            "{} {}",
            self.version.as_deref().unwrap_or("unknown"),
            self.cipher.as_deref().unwrap_or("unknown")
        )
    }
}

/// The client's byte stream, either side of a TLS upgrade.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain {
        stream: BufReader<Stream>,
    },
    Tls {
        stream: Box<BufReader<TlsStream<Stream>>>,
    },
    /// Left behind while the stream is moved through an upgrade, and after
    /// a failed one.
    Closed,
}

/// Reads up to and including `\n`, at most `limit` bytes.
async fn read_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
    buffer: &mut Vec<u8>,
) -> std::io::Result<usize> {
    (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', buffer)
        .await
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self::Plain {
            stream: BufReader::with_capacity(BUFFER_SIZE, stream),
        }
    }

    /// Writes `response` followed by CRLF and flushes.
    pub(crate) async fn send<S: Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<usize> {
        let buffer = format!("{response}\r\n");

        match self {
            Self::Plain { stream } => {
                stream.write_all(buffer.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Tls { stream } => {
                stream.write_all(buffer.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Closed => return Err(ConnectionError::Closed),
        }

        Ok(buffer.len())
    }

    async fn read_raw(&mut self, limit: usize, buffer: &mut Vec<u8>) -> ConnectionResult<usize> {
        Ok(match self {
            Self::Plain { stream } => read_limited(stream, limit, buffer).await?,
            Self::Tls { stream } => read_limited(stream.as_mut(), limit, buffer).await?,
            Self::Closed => return Err(ConnectionError::Closed),
        })
    }

    /// Reads one line, terminator included. `None` at end of stream. A line
    /// longer than `limit` is consumed and reported as
    /// [`ConnectionError::LineTooLong`].
    pub(crate) async fn read_line(&mut self, limit: usize) -> ConnectionResult<Option<Vec<u8>>> {
        let mut line = Vec::new();

        if self.read_raw(limit, &mut line).await? == 0 {
            return Ok(None);
        }

        if line.len() >= limit && !line.ends_with(b"\n") {
            let mut rest = Vec::new();
            loop {
                rest.clear();
                if self.read_raw(limit, &mut rest).await? == 0 || rest.ends_with(b"\n") {
                    break;
                }
            }

            return Err(ConnectionError::LineTooLong(limit));
        }

        Ok(Some(line))
    }

    /// Performs the server side TLS handshake on the underlying stream.
    /// Anything the client pipelined before the handshake is discarded.
    pub(crate) async fn upgrade(self, acceptor: &TlsAcceptor) -> TlsResult<(Self, TlsInfo)> {
        internal!(level = DEBUG, "Upgrading connection ...");

        match self {
            Self::Plain { stream } => {
                if !stream.buffer().is_empty() {
                    internal!(
                        level = WARN,
                        "Discarding {} bytes sent ahead of the TLS handshake",
                        stream.buffer().len()
                    );
                }

                let stream = acceptor.accept(stream.into_inner()).await?;
                let info = TlsInfo::of(stream.get_ref().1);

                Ok((
                    Self::Tls {
                        stream: Box::new(BufReader::with_capacity(BUFFER_SIZE, stream)),
                    },
                    info,
                ))
            }
            Self::Tls { .. } => Err(TlsError::Rustls(String::from(
                "Connection is already secured",
            ))),
            Self::Closed => Err(TlsError::Io(std::io::ErrorKind::NotConnected.into())),
        }
    }

    pub(crate) async fn shutdown(&mut self) -> ConnectionResult<()> {
        match self {
            Self::Plain { stream } => stream.shutdown().await?,
            Self::Tls { stream } => stream.shutdown().await?,
            Self::Closed => {}
        }

        Ok(())
    }
}
