use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use tokio::{
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::{
    controller::Signal,
    internal,
    server::Server,
    smtp::session::{Session, SessionConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain SMTP, upgradable with `STARTTLS`.
    Plain,
    /// TLS from the first byte.
    Implicit,
}

pub struct Listener {
    listener: TcpListener,
    mode: Mode,
}

impl Listener {
    /// # Errors
    ///
    /// If the address cannot be bound.
    pub async fn bind(address: SocketAddr, mode: Mode) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, mode })
    }

    /// # Errors
    ///
    /// If the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until shutdown is signalled, then waits for the
    /// open sessions to finish.
    ///
    /// # Errors
    ///
    /// If the listener's address cannot be read.
    pub async fn serve(
        self,
        server: Arc<Server>,
        shutdown: broadcast::Sender<Signal>,
    ) -> anyhow::Result<()> {
        let local = self.listener.local_addr()?;
        if self.mode == Mode::Plain {
            server.listening(local);
        }

        internal!(level = INFO, "Listening on {local} ({:?})", self.mode);

        let mut receiver = shutdown.subscribe();
        let mut sessions: Vec<JoinHandle<()>> = Vec::default();

        loop {
            tokio::select! {
                signal = receiver.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            "Listener {local} received shutdown signal, finishing {} session(s) ...",
                            sessions.len()
                        );
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => {
                            internal!(level = WARN, "Failed to accept connection on {local}: {err}");
                            continue;
                        }
                    };

                    sessions.retain(|session| !session.is_finished());

                    let guard = server.track();
                    let config = SessionConfig::builder()
                        .with_peer(peer)
                        .with_local(stream.local_addr().unwrap_or(local))
                        .with_implicit_tls(self.mode == Mode::Implicit)
                        .build();
                    let session = Session::create(stream, config, Arc::clone(&server));
                    let signals = shutdown.subscribe();

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signals).await {
                            internal!(level = WARN, "Session from {peer} failed: {err}");
                        }
                        drop(guard);
                    }));
                }
            }
        }

        join_all(sessions).await;
        internal!(level = INFO, "Listener {local} stopped");
        Ok(())
    }
}
