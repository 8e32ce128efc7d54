//! Per connection protocol driver.
//!
//! A session reads one line at a time and hands it either to a handler
//! waiting on [`Verdict::Read`](super::handler::Verdict::Read), or to the
//! chain of the command it names. Transport changes requested by handlers
//! (message transfer and TLS upgrades) run once the accepting reply is sent.

mod events;
mod io;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};

pub use events::Outcome;
use events::Pending;

use super::{
    command::Payload,
    connection::Connection,
    context::{Client, Context},
    handler::{Handler, Reply, Transition},
    registry::{Handlers, Overlay},
};
use crate::{
    Signal,
    error::{ConnectionError, SessionError, SessionResult},
    internal,
    server::Server,
    status::Status,
};

/// Longest command line accepted, terminator included.
pub(crate) const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Wrap the connection in TLS before the greeting.
    pub implicit_tls: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

#[derive(Debug)]
pub struct SessionConfigBuilder {
    peer: SocketAddr,
    local: SocketAddr,
    implicit_tls: bool,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        let unspecified = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            peer: unspecified,
            local: unspecified,
            implicit_tls: false,
        }
    }
}

impl SessionConfigBuilder {
    #[must_use]
    pub const fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = peer;
        self
    }

    #[must_use]
    pub const fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = local;
        self
    }

    #[must_use]
    pub const fn with_implicit_tls(mut self, implicit_tls: bool) -> Self {
        self.implicit_tls = implicit_tls;
        self
    }

    #[must_use]
    pub const fn build(self) -> SessionConfig {
        SessionConfig {
            peer: self.peer,
            local: self.local,
            implicit_tls: self.implicit_tls,
        }
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    pub(super) context: Context,
    pub(super) connection: Connection<Stream>,
    server: Arc<Server>,
    handlers: Arc<Handlers>,
    overlay: Overlay,
    /// A handler waiting for the next raw line.
    pending: Option<Pending>,
    /// Lines written by handlers, not yet sent.
    output: Vec<String>,
    transition: Option<Transition>,
    closed: bool,
    implicit_tls: bool,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(stream: Stream, config: SessionConfig, server: Arc<Server>) -> Self {
        let address = config.peer.ip().to_canonical();
        let client = Client {
            hostname: format!("[{address}]"),
            address,
        };

        let mut session = Self {
            context: Context::new(Arc::clone(&server), client, config.local.ip().to_canonical()),
            connection: Connection::new(stream),
            handlers: server.registry().snapshot(),
            overlay: Overlay::default(),
            pending: None,
            output: Vec::new(),
            transition: None,
            closed: false,
            implicit_tls: config.implicit_tls,
            server,
        };

        let server = Arc::clone(&session.server);
        server.prepare(&session.context, &mut session.overlay);

        session
    }

    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Adds a handler for `event` to this session only, after every
    /// registered handler.
    pub fn on(&mut self, event: &str, handler: impl Handler + 'static) {
        self.overlay.on(event, handler);
    }

    /// Drives the session until the client leaves, a handler ends it, or
    /// the server shuts down.
    ///
    /// # Errors
    ///
    /// On transport failures other than the client hanging up.
    pub async fn run(mut self, shutdown: broadcast::Receiver<Signal>) -> SessionResult<()> {
        let id = self.context.id.clone();
        let peer = self.context.client.address;
        internal!(level = INFO, session = %id, "Connection from {peer}");

        let result = match self.run_inner(shutdown).await {
            Err(SessionError::Connection(err)) if err.is_disconnect() => {
                internal!(level = DEBUG, session = %id, "Client disconnected: {err}");
                Ok(())
            }
            other => other,
        };

        if let Err(err) = self.connection.shutdown().await
            && !err.is_disconnect()
        {
            internal!(level = DEBUG, session = %id, "Failed to shut down connection: {err}");
        }

        internal!(level = INFO, session = %id, "Connection from {peer} closed");
        result
    }

    async fn run_inner(&mut self, mut shutdown: broadcast::Receiver<Signal>) -> SessionResult<()> {
        if self.implicit_tls
            && let Err(err) = self.upgrade().await
        {
            internal!(level = WARN, session = %self.context.id, "TLS handshake failed: {err}");
            return Ok(());
        }

        let address = self.context.client.address;
        if let Some(hostname) = self.server.resolver().reverse(address).await {
            self.context.client.hostname = hostname;
        }

        self.context.busy = true;
        let greeting = self
            .emit(
                "connect",
                Payload::Text(self.context.client.hostname.clone()),
                true,
            )
            .await;
        self.context.busy = false;
        greeting?;

        let idle = Duration::from_millis(self.server.config().limits.idle_timeout);

        while !self.closed {
            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        let hostname = &self.server.config().hostname;
                        let reply = Reply::new(Status::Unavailable, format!("{hostname} Server shutting down"));
                        self.close(&reply).await?;
                    }
                }

                line = tokio::time::timeout(idle, self.connection.read_line(MAX_LINE)) => match line {
                    Err(_elapsed) => self.timeout().await?,
                    Ok(Ok(Some(line))) => self.receive(&line).await?,
                    Ok(Ok(None)) => {
                        internal!(level = DEBUG, session = %self.context.id, "Client closed the connection");
                        break;
                    }
                    Ok(Err(ConnectionError::LineTooLong(limit))) => {
                        self.send(&format!("{} Error: line exceeds {limit} bytes", Status::SyntaxError)).await?;
                    }
                    Ok(Err(err)) => return Err(err.into()),
                }
            }
        }

        Ok(())
    }

    /// The idle timer fired. A handler waiting for a line gives up first.
    async fn timeout(&mut self) -> SessionResult<()> {
        if let Some(pending) = self.pending.take() {
            internal!(
                level = DEBUG,
                session = %self.context.id,
                "Abandoning pending read for {}",
                pending.command()
            );
        }

        self.emit("timeout", Payload::None, true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test;
