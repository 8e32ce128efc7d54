use std::{
    net::SocketAddr,
    sync::{Arc, LazyLock},
};

use futures_util::future::join_all;
use tokio::sync::broadcast;

use crate::{
    Config, internal,
    listener::{Listener, Mode},
    logging,
    server::Server,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Waits for CTRL+C or SIGTERM and broadcasts [`Signal::Shutdown`].
async fn shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => internal!(level = INFO, "CTRL+C entered, shutting down"),
            _ = terminate.recv() => internal!(level = INFO, "SIGTERM received, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        internal!(level = INFO, "CTRL+C entered, shutting down");
    }

    let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
    Ok(())
}

pub struct Controller {
    config: Config,
}

impl Controller {
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server and everything it controls until shutdown.
    ///
    /// # Errors
    ///
    /// If the server cannot be built, the relay cannot start, or a
    /// listener cannot be bound.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!("Controller running");

        let server = Server::builder(self.config).build()?;

        if let Some(relay) = server.relay() {
            relay.start().await?;
        }

        let listen = &server.config().listen;
        let addresses: Vec<(SocketAddr, Mode)> = [
            listen.smtp.map(|address| (address, Mode::Plain)),
            listen.submission.map(|address| (address, Mode::Plain)),
            listen.smtps.map(|address| (address, Mode::Implicit)),
        ]
        .into_iter()
        .flatten()
        .collect();

        if addresses.is_empty() {
            anyhow::bail!("No listeners configured");
        }

        let mut listeners = Vec::with_capacity(addresses.len());
        for (address, mode) in addresses {
            if mode == Mode::Implicit && !server.has_tls() {
                internal!(level = WARN, "Skipping implicit TLS listener on {address}: TLS is not configured");
                continue;
            }

            let listener = Listener::bind(address, mode)
                .await
                .map_err(|err| anyhow::anyhow!("Failed to bind {address}: {err}"))?;
            listeners.push(tokio::spawn(
                listener.serve(Arc::clone(&server), SHUTDOWN_BROADCAST.clone()),
            ));
        }

        let mut receiver = SHUTDOWN_BROADCAST.subscribe();
        tokio::select! {
            result = shutdown() => result?,
            _ = receiver.recv() => {}
        }

        for result in join_all(listeners).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => internal!(level = ERROR, "Listener failed: {err:#}"),
                Err(err) => internal!(level = ERROR, "Listener task failed: {err}"),
            }
        }

        if let Some(relay) = server.relay() {
            relay.stop();
        }

        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
        internal!(level = INFO, "Shut down");

        Ok(())
    }
}
