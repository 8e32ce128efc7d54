//! State shared by every session: configuration, handlers, the relay and
//! the API user.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio_rustls::TlsAcceptor;

use crate::{
    Config,
    client::{self, ClientError, MessageBuilder, Response, Timeouts, Transaction},
    error::RegistryError,
    internal,
    relay::{
        Deliver, Notify, Relay, SmtpDeliver,
        dns::{DnsResolver, Resolve},
    },
    smtp::{
        context::{Context, User},
        handler::HandlerDef,
        registry::{Overlay, Registry},
    },
};

type SessionHook = Box<dyn Fn(&Context, &mut Overlay) + Send + Sync>;

pub struct Server {
    config: Arc<Config>,
    registry: Registry,
    relay: Option<Arc<Relay>>,
    api_user: User,
    connections: AtomicUsize,
    tls: Option<TlsAcceptor>,
    resolver: Arc<dyn Resolve>,
    /// Where `send_mail` submits, set by the first plain listener.
    submission: OnceLock<SocketAddr>,
    hooks: Vec<SessionHook>,
}

pub struct ServerBuilder {
    config: Config,
    resolver: Option<Arc<dyn Resolve>>,
    deliver: Option<Arc<dyn Deliver>>,
    notify: Option<Arc<dyn Notify>>,
    handlers: Vec<(String, HandlerDef)>,
    hooks: Vec<SessionHook>,
}

impl ServerBuilder {
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replaces SMTP delivery of relayed mail.
    #[must_use]
    pub fn with_deliver(mut self, deliver: Arc<dyn Deliver>) -> Self {
        self.deliver = Some(deliver);
        self
    }

    /// Replaces how bounces are sent; by default through
    /// [`Server::send_mail`].
    #[must_use]
    pub fn with_notify(mut self, notify: Arc<dyn Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Registers a handler before the registry is first sorted.
    #[must_use]
    pub fn with_handler(mut self, event: &str, def: HandlerDef) -> Self {
        self.handlers.push((event.to_string(), def));
        self
    }

    /// Runs `hook` for every new session, before its greeting.
    #[must_use]
    pub fn on_session<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &mut Overlay) + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(hook));
        self
    }

    /// # Errors
    ///
    /// If the TLS material cannot be loaded, or no resolver was given and
    /// the system resolver cannot be set up.
    pub fn build(self) -> anyhow::Result<Arc<Server>> {
        let config = Arc::new(self.config.normalised());

        let tls = config
            .tls
            .as_ref()
            .map(crate::smtp::connection::TlsContext::acceptor)
            .transpose()?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(DnsResolver::new()?) as Arc<dyn Resolve>,
        };

        let registry = Registry::load(self.handlers, &config);
        let api_user = User::new(
            ulid::Ulid::new().to_string(),
            ulid::Ulid::new().to_string(),
        );

        let (deliver, notify, hooks) = (self.deliver, self.notify, self.hooks);

        Ok(Arc::new_cyclic(|server: &Weak<Server>| {
            let relay = config.relay.enabled.then(|| {
                let deliver = deliver.unwrap_or_else(|| {
                    Arc::new(SmtpDeliver::new(Arc::clone(&config))) as Arc<dyn Deliver>
                });
                let notify = notify.unwrap_or_else(|| {
                    Arc::new(ServerNotifier(Weak::clone(server))) as Arc<dyn Notify>
                });
                Relay::new(
                    Arc::clone(&config),
                    Arc::clone(&resolver),
                    deliver,
                    notify,
                )
            });

            Server {
                config,
                registry,
                relay,
                api_user,
                connections: AtomicUsize::new(0),
                tls,
                resolver,
                submission: OnceLock::new(),
                hooks,
            }
        }))
    }
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            resolver: None,
            deliver: None,
            notify: None,
            handlers: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn relay(&self) -> Option<&Arc<Relay>> {
        self.relay.as_ref()
    }

    pub fn resolver(&self) -> &Arc<dyn Resolve> {
        &self.resolver
    }

    pub const fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub const fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    /// Open client connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Counts a connection until the guard is dropped.
    pub(crate) fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(Arc::clone(self))
    }

    pub fn is_api_user(&self, user: &User) -> bool {
        *user == self.api_user
    }

    /// Registers a handler on the live registry. Sessions already running
    /// keep the handlers they started with.
    ///
    /// # Errors
    ///
    /// If the event or handler name is empty.
    pub fn add_handler(&self, event: &str, def: HandlerDef) -> Result<(), RegistryError> {
        self.registry.add_handler(event, def)
    }

    pub(crate) fn prepare(&self, context: &Context, overlay: &mut Overlay) {
        for hook in &self.hooks {
            hook(context, overlay);
        }
    }

    /// Remembers the first plain listener as the target of
    /// [`send_mail`](Self::send_mail).
    pub(crate) fn listening(&self, address: SocketAddr) {
        let ip = match address.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };

        if self.submission.set(SocketAddr::new(ip, address.port())).is_ok() {
            internal!(level = DEBUG, "Submitting API mail to {ip}:{}", address.port());
        }
    }

    /// Submits `message` to this server's own listener, authenticated as the
    /// API user, so it passes through the same handlers as any other mail.
    ///
    /// # Errors
    ///
    /// If the message is incomplete, no listener is running, or the server
    /// refuses it.
    pub async fn send_mail(&self, message: MessageBuilder) -> client::Result<Response> {
        let from = message.envelope_from()?;
        let to = message.envelope_to()?;
        let body = message.build()?;

        let address = self
            .submission
            .get()
            .copied()
            .or_else(|| {
                self.config
                    .listen
                    .smtp
                    .map(|smtp| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), smtp.port()))
            })
            .ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no SMTP listener to submit to",
                ))
            })?;

        let relay = &self.config.relay;
        Transaction {
            identity: message.identity_tag(),
            hostname: &self.config.hostname,
            server_name: "localhost",
            starttls: false,
            auth: Some(&self.api_user),
            from: &from,
            to: &to,
            message: body.as_bytes(),
            timeouts: Timeouts {
                greeting: Duration::from_secs(relay.greeting_timeout_secs),
                command: Duration::from_secs(relay.command_timeout_secs),
            },
        }
        .send(address)
        .await
    }
}

/// Releases a slot in [`Server::connections`] on drop.
pub(crate) struct ConnectionGuard(Arc<Server>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sends the relay's bounces through [`Server::send_mail`].
struct ServerNotifier(Weak<Server>);

#[async_trait]
impl Notify for ServerNotifier {
    async fn notify(&self, message: MessageBuilder) -> anyhow::Result<()> {
        let server = self
            .0
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Server is shutting down"))?;

        server.send_mail(message).await?;
        Ok(())
    }
}
