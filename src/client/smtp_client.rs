//! One outbound SMTP connection.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, Result},
    response::Response,
};
use crate::{incoming, outgoing};

const BUFFER_SIZE: usize = 8192;

const MAX_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Connecting and waiting for the greeting.
    pub greeting: Duration,
    /// Each command, including the end of message data.
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            greeting: Duration::from_secs(120),
            command: Duration::from_secs(120),
        }
    }
}

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };

        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        Ok(n)
    }

    async fn upgrade(self, domain: &str) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                // Opportunistic TLS: certificates are not verified.
                let config = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth();

                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|err| ClientError::TlsError(format!("Invalid domain: {err}")))?;

                let stream = TlsConnector::from(Arc::new(config))
                    .connect(server_name, stream)
                    .await
                    .map_err(|err| ClientError::TlsError(err.to_string()))?;

                Ok(Self::Tls(Box::new(stream)))
            }
            Self::Tls(_) => Err(ClientError::TlsError(String::from(
                "Connection is already TLS",
            ))),
        }
    }
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Sends commands and reads replies, logging every line with the
/// transaction id and the identity of whoever is sending.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    timeouts: Timeouts,
    id: String,
    identity: String,
}

impl SmtpClient {
    /// Connects to `address` and waits for the greeting.
    ///
    /// # Errors
    ///
    /// If the connection fails, times out, or the greeting is negative.
    pub async fn connect(
        address: SocketAddr,
        server_domain: impl Into<String>,
        identity: impl Into<String>,
        timeouts: Timeouts,
    ) -> Result<(Self, Response)> {
        let stream = tokio::time::timeout(timeouts.greeting, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout("connection"))??;

        let mut client = Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            timeouts,
            id: ulid::Ulid::new().to_string(),
            identity: identity.into(),
        };

        crate::internal!(
            level = DEBUG,
            transaction = %client.id,
            identity = %client.identity,
            "Connected to {address}"
        );

        let greeting = tokio::time::timeout(timeouts.greeting, client.read_response())
            .await
            .map_err(|_| ClientError::Timeout("greeting"))??
            .ensure_positive()?;

        Ok((client, greeting))
    }

    /// Correlates the log lines of this connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn send_line(&mut self, line: &str, logged: &str) -> Result<()> {
        outgoing!(transaction = %self.id, identity = %self.identity, "{logged}");

        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        connection.send(format!("{line}\r\n").as_bytes()).await?;
        connection.flush().await
    }

    async fn exchange(&mut self, line: &str, logged: &str) -> Result<Response> {
        let timeout = self.timeouts.command;
        tokio::time::timeout(timeout, async {
            self.send_line(line, logged).await?;
            self.read_response().await
        })
        .await
        .map_err(|_| ClientError::Timeout("command reply"))?
    }

    /// Sends `command` and returns the reply, whatever its code.
    ///
    /// # Errors
    ///
    /// On transport failures and timeouts.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.exchange(command, command).await
    }

    /// `EHLO`, falling back to `HELO` when the server refuses it.
    ///
    /// # Errors
    ///
    /// If both are refused.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        if response.is_permanent_error() {
            return self.command(&format!("HELO {domain}")).await?.ensure_positive();
        }

        response.ensure_positive()
    }

    /// Upgrades the connection.
    ///
    /// # Errors
    ///
    /// If the server refuses or the handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?.ensure_positive()?;

        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        self.buffer_pos = 0;
        self.connection = Some(connection.upgrade(&self.server_domain).await?);

        Ok(response)
    }

    /// `AUTH PLAIN` with an initial response.
    ///
    /// # Errors
    ///
    /// If the credentials are refused.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        self.exchange(&format!("AUTH PLAIN {token}"), "AUTH PLAIN ****")
            .await?
            .ensure_positive()
    }

    /// # Errors
    ///
    /// If the sender is refused.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        let from = if from == "<>" { "" } else { from };
        self.command(&format!("MAIL FROM:<{from}>"))
            .await?
            .ensure_positive()
    }

    /// # Errors
    ///
    /// If the recipient is refused.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>"))
            .await?
            .ensure_positive()
    }

    /// # Errors
    ///
    /// If the server does not answer 354.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await?.ensure_positive()
    }

    /// Sends the message, dot stuffed, and the terminating `.`.
    ///
    /// # Errors
    ///
    /// If the message is refused.
    pub async fn send_data(&mut self, message: &[u8]) -> Result<Response> {
        let timeout = self.timeouts.command;
        let data = stuff(message);

        outgoing!(
            transaction = %self.id,
            identity = %self.identity,
            "[{} bytes of message data]",
            data.len()
        );

        tokio::time::timeout(timeout, async {
            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            connection.send(&data).await?;
            connection.send(b".\r\n").await?;
            connection.flush().await?;
            self.read_response().await
        })
        .await
        .map_err(|_| ClientError::Timeout("end of data reply"))??
        .ensure_positive()
    }

    /// # Errors
    ///
    /// On transport failures.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        self.connection = None;
        response
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                for line in &response.lines {
                    incoming!(
                        transaction = %self.id,
                        identity = %self.identity,
                        "{} {line}",
                        response.code
                    );
                }

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let size = self.buffer.len() * 2;
                if size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Normalises line endings to CRLF, doubles leading dots and makes sure
/// the message ends with CRLF.
fn stuff(message: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(message.len() + 64);

    for line in message.split_inclusive(|&byte| byte == b'\n') {
        let line = line
            .strip_suffix(b"\n")
            .map_or(line, |line| line.strip_suffix(b"\r").unwrap_or(line));

        if line.first() == Some(&b'.') {
            data.push(b'.');
        }
        data.extend_from_slice(line);
        data.extend_from_slice(b"\r\n");
    }

    data
}
