use std::{fmt::Display, path::Path, sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

use super::Session;
use crate::{
    error::{ConnectionError, SessionResult, TlsError},
    incoming, internal, outgoing,
    smtp::{
        command::{Command, Payload},
        connection::Connection,
        handler::{Reply, Transition},
    },
    status::Status,
};

/// Longest line accepted while receiving a message.
const MAX_DATA_LINE: usize = 64 * 1024;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(super) async fn send<S: Display + Send + Sync>(&mut self, line: &S) -> SessionResult<()> {
        outgoing!(
            session = %self.context.id,
            transaction = self.context.transaction,
            "{line}"
        );

        self.connection.send(line).await?;
        Ok(())
    }

    /// Sends every line handlers wrote during their turn.
    pub(super) async fn flush(&mut self) -> SessionResult<()> {
        for line in std::mem::take(&mut self.output) {
            self.send(&line).await?;
        }

        Ok(())
    }

    /// Sends a last reply and stops reading.
    pub(super) async fn close(&mut self, reply: &Reply) -> SessionResult<()> {
        self.closed = true;
        self.send(reply).await
    }

    /// One line from the client, either for a waiting handler or as a new
    /// command.
    pub(super) async fn receive(&mut self, line: &[u8]) -> SessionResult<()> {
        let line = String::from_utf8_lossy(line)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        if let Some(pending) = self.pending.take() {
            incoming!(
                session = %self.context.id,
                transaction = self.context.transaction,
                command = pending.command(),
                "[{} bytes]",
                line.len()
            );
            self.resume(pending, line).await?;
        } else {
            let command = Command::from(line.as_str());
            if command.name == "auth" {
                let mechanism = command.text().and_then(|text| text.split_whitespace().next());
                incoming!(
                    session = %self.context.id,
                    transaction = self.context.transaction,
                    "AUTH {}",
                    mechanism.unwrap_or_default()
                );
            } else {
                incoming!(
                    session = %self.context.id,
                    transaction = self.context.transaction,
                    "{line}"
                );
            }

            self.dispatch(command, false).await?;
        }

        self.perform_transition().await
    }

    async fn perform_transition(&mut self) -> SessionResult<()> {
        if self.closed {
            self.transition = None;
            return Ok(());
        }

        match self.transition.take() {
            None => Ok(()),
            Some(Transition::StartTls) => {
                if let Err(err) = self.upgrade().await {
                    internal!(
                        level = WARN,
                        session = %self.context.id,
                        "TLS handshake failed: {err}"
                    );
                    self.closed = true;
                    return Ok(());
                }

                self.context.reset();
                Ok(())
            }
            Some(Transition::Data) => {
                self.context.busy = true;
                let result = self.receive_message().await;
                self.context.busy = false;
                result
            }
        }
    }

    /// Swaps the plain stream for a TLS one. Nothing is dispatched until the
    /// handshake completes.
    pub(super) async fn upgrade(&mut self) -> SessionResult<()> {
        let server = Arc::clone(&self.server);
        let acceptor = server.tls_acceptor().ok_or(TlsError::NotConfigured)?;

        self.context.busy = true;
        let connection = std::mem::replace(&mut self.connection, Connection::Closed);
        let (connection, info) = connection.upgrade(acceptor).await?;
        self.connection = connection;
        self.context.secure = true;
        self.context.busy = false;

        internal!(
            level = DEBUG,
            session = %self.context.id,
            "Connection secured with {info}"
        );

        Ok(())
    }

    fn received_header(&self) -> String {
        let context = &self.context;
        let protocol = format!(
            "{}{}{}",
            if context.is_accepted("ehlo") {
                "ESMTP"
            } else {
                "SMTP"
            },
            if context.secure { "S" } else { "" },
            if context.is_accepted("auth") { "A" } else { "" }
        );

        format!(
            "Received: from {} ({})\r\n\tby {} ({}) with {protocol}; {}\r\n",
            context.client.hostname,
            context.client.address,
            context.config().hostname,
            context.local,
            chrono::Utc::now().to_rfc2822()
        )
    }

    /// Reads a dot terminated message into a spool file and emits `queue`
    /// for it.
    ///
    /// Spool failures are logged and the rest of the message is still read,
    /// so the client gets a `451` instead of a dropped connection.
    async fn receive_message(&mut self) -> SessionResult<()> {
        let server = Arc::clone(&self.server);
        let config = server.config();
        let limits = &config.limits;
        let idle = Duration::from_millis(limits.idle_timeout);

        let path = config.spool_dir.join(format!(
            "{}-{}.msg",
            self.context.id, self.context.transaction
        ));

        let header = self.received_header();
        let mut spool = match tokio::fs::File::create(&path).await {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                self.spool_failed(&path, &err);
                None
            }
        };
        if let Err(err) = append(&mut spool, header.as_bytes()).await {
            self.spool_failed(&path, &err);
        }

        let mut size = 0;
        let mut exceeded = false;

        loop {
            let line = match tokio::time::timeout(idle, self.connection.read_line(MAX_DATA_LINE)).await
            {
                Ok(Ok(Some(line))) => line,
                Ok(Err(ConnectionError::LineTooLong(_))) => {
                    exceeded = true;
                    continue;
                }
                Err(_elapsed) => {
                    drop(spool);
                    remove(&path).await;
                    self.emit("timeout", Payload::None, true).await?;
                    return Ok(());
                }
                Ok(Ok(None)) => {
                    drop(spool);
                    remove(&path).await;
                    return Err(ConnectionError::Closed.into());
                }
                Ok(Err(err)) => {
                    drop(spool);
                    remove(&path).await;
                    return Err(err.into());
                }
            };

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            let line = line.strip_prefix(b".").unwrap_or(&line);
            size += line.len();
            if size > limits.message_size {
                exceeded = true;
            }

            if !exceeded && let Err(err) = append(&mut spool, line).await {
                self.spool_failed(&path, &err);
            }
        }

        let spooled = match spool.take() {
            Some(mut file) => match file.flush().await {
                Ok(()) => true,
                Err(err) => {
                    self.spool_failed(&path, &err);
                    false
                }
            },
            None => false,
        };

        if exceeded {
            remove(&path).await;
            self.context.reset_transaction();
            return self
                .send(&format!(
                    "{} Error: Message size exceeds fixed maximum message size",
                    Status::ExceededStorage
                ))
                .await;
        }

        if !spooled {
            remove(&path).await;
            self.context.reset_transaction();
            return self
                .send(&format!(
                    "{} Error: Error while processing the mail",
                    Status::ActionUnavailable
                ))
                .await;
        }

        internal!(
            level = DEBUG,
            session = %self.context.id,
            transaction = self.context.transaction,
            "Received {size} bytes, spooled to {}",
            path.display()
        );

        self.emit("queue", Payload::File(path.clone()), true).await?;
        self.transition = None;
        self.context.transaction += 1;
        self.context.reset_transaction();
        remove(&path).await;

        Ok(())
    }

    fn spool_failed(&self, path: &Path, err: &std::io::Error) {
        internal!(
            level = ERROR,
            session = %self.context.id,
            transaction = self.context.transaction,
            "Failed to spool message to {}: {err}",
            path.display()
        );
    }
}

/// Appends to the spool file, giving it up on the first failure.
async fn append(
    spool: &mut Option<BufWriter<tokio::fs::File>>,
    bytes: &[u8],
) -> std::io::Result<()> {
    let Some(file) = spool else {
        return Ok(());
    };

    let result = file.write_all(bytes).await;
    if result.is_err() {
        *spool = None;
    }
    result
}

async fn remove(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        internal!(
            level = WARN,
            "Failed to remove spool file {}: {err}",
            path.display()
        );
    }
}
