//! Durable outbound delivery.
//!
//! Every accepted message is stored once per recipient in the queue
//! directory, as `<id>.msg` plus an `<id>.msg.info` record, and handed to a
//! [`TaskQueue`]. Failed attempts are retried with a delay growing with the
//! square of the attempt count until `retry_hours` have passed; permanent
//! failures and expired mail are bounced to the sender.

pub mod dns;
pub mod mail;
pub mod ndr;

use std::{
    net::SocketAddr,
    path::Path,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use self::{
    dns::{DnsError, MailServer, Resolve},
    mail::{Failure, Mail},
};
use crate::{
    Config,
    client::{MessageBuilder, Timeouts, Transaction},
    error::RelayError,
    headers::Headers,
    internal,
    queue::{QueueConfig, TaskQueue, Worker},
    smtp::{context::Envelope, plugins::domain_of},
};

/// Hands one queued message to one mail server.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        server: &MailServer,
        address: SocketAddr,
        mail: &Mail,
        message: &[u8],
    ) -> Result<(), RelayError>;
}

/// Sends messages the relay composes itself.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, message: MessageBuilder) -> anyhow::Result<()>;
}

/// Delivers over SMTP, upgrading with `STARTTLS` when offered.
pub struct SmtpDeliver {
    config: Arc<Config>,
}

impl SmtpDeliver {
    pub const fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Deliver for SmtpDeliver {
    async fn deliver(
        &self,
        server: &MailServer,
        address: SocketAddr,
        mail: &Mail,
        message: &[u8],
    ) -> Result<(), RelayError> {
        let relay = &self.config.relay;

        Transaction {
            identity: "relay",
            hostname: &relay.hostname,
            server_name: &server.host,
            starttls: true,
            auth: None,
            from: mail.sender(),
            to: mail.recipients(),
            message,
            timeouts: Timeouts {
                greeting: Duration::from_secs(relay.greeting_timeout_secs),
                command: Duration::from_secs(relay.command_timeout_secs),
            },
        }
        .send(address)
        .await?;

        Ok(())
    }
}

struct RelayWorker(Weak<Relay>);

#[async_trait]
impl Worker<Mail> for RelayWorker {
    async fn run(&self, mail: Mail) -> anyhow::Result<()> {
        let Some(relay) = self.0.upgrade() else {
            return Ok(());
        };

        relay.process(mail).await?;
        Ok(())
    }
}

pub struct Relay {
    config: Arc<Config>,
    resolver: Arc<dyn Resolve>,
    deliver: Arc<dyn Deliver>,
    notify: Arc<dyn Notify>,
    queue: TaskQueue<Mail>,
}

impl Relay {
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<dyn Resolve>,
        deliver: Arc<dyn Deliver>,
        notify: Arc<dyn Notify>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|relay| {
            let queue = TaskQueue::new(
                QueueConfig {
                    interval: Duration::from_millis(config.relay.tick_interval_ms),
                    concurrency: config.relay.concurrent_transactions,
                },
                RelayWorker(Weak::clone(relay)),
            );

            Self {
                config,
                resolver,
                deliver,
                notify,
                queue,
            }
        })
    }

    pub fn queue_dir(&self) -> &Path {
        &self.config.relay.queue_dir
    }

    /// Tasks waiting or in flight.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Reloads persisted mail and starts delivering.
    ///
    /// # Errors
    ///
    /// If the queue directory cannot be created or listed.
    pub async fn start(&self) -> Result<usize, RelayError> {
        tokio::fs::create_dir_all(self.queue_dir()).await?;
        let reloaded = self.reload().await?;
        self.queue.start();

        internal!(
            level = INFO,
            "Relay started with {reloaded} queued mail(s) from {}",
            self.queue_dir().display()
        );

        Ok(reloaded)
    }

    /// Stops the delivery driver. Attempts in flight finish on their own.
    pub fn stop(&self) {
        self.queue.kill();
    }

    /// Schedules every record in the queue directory for immediate
    /// delivery. Records that cannot be read are skipped.
    ///
    /// # Errors
    ///
    /// If the directory cannot be listed.
    pub async fn reload(&self) -> Result<usize, RelayError> {
        let mut entries = tokio::fs::read_dir(self.queue_dir()).await?;
        let mut reloaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !mail::is_meta(&path) {
                continue;
            }

            match Mail::read(&path).await {
                Ok(mail) => {
                    internal!(
                        level = DEBUG,
                        mail = %mail.id,
                        failures = mail.failures.len(),
                        "Reloaded queued mail"
                    );
                    self.queue.schedule(Duration::ZERO, mail);
                    reloaded += 1;
                }
                Err(err) => {
                    internal!(
                        level = ERROR,
                        "Skipping unreadable queue record {}: {err}",
                        path.display()
                    );
                }
            }
        }

        Ok(reloaded)
    }

    /// Persists `source` for each recipient of `envelope` and schedules the
    /// copies for delivery.
    ///
    /// # Errors
    ///
    /// If the envelope has no sender or recipients, or a copy cannot be
    /// written. Copies written before the failure are removed.
    pub async fn add(
        &self,
        envelope: &Envelope,
        source: &Path,
        headers: Headers,
    ) -> Result<Vec<Mail>, RelayError> {
        let from = envelope
            .from
            .as_deref()
            .filter(|from| !from.is_empty())
            .ok_or_else(|| RelayError::InvalidEnvelope(String::from("missing sender")))?;

        if envelope.to.is_empty() {
            return Err(RelayError::InvalidEnvelope(String::from(
                "missing recipients",
            )));
        }

        tokio::fs::create_dir_all(self.queue_dir()).await?;

        let mut added = Vec::with_capacity(envelope.to.len());
        for to in &envelope.to {
            let mail = Mail::new(self.queue_dir(), from, to, headers.clone());

            if let Err(err) = store(source, &mail).await {
                self.remove(&mail).await;
                for mail in &added {
                    self.remove(mail).await;
                }
                return Err(err);
            }

            internal!(
                level = INFO,
                mail = %mail.id,
                "Queued mail from {from} to {to}"
            );
            added.push(mail);
        }

        for mail in &added {
            self.queue.schedule(Duration::ZERO, mail.clone());
        }

        Ok(added)
    }

    /// One delivery attempt, followed by removal, a rescheduled retry, or a
    /// bounce.
    ///
    /// # Errors
    ///
    /// If a failed attempt cannot be recorded.
    pub async fn process(&self, mut mail: Mail) -> Result<(), RelayError> {
        let relay = &self.config.relay;
        let window = i64::try_from(relay.retry_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .unwrap_or(TimeDelta::MAX);

        if Utc::now() - mail.created >= window {
            internal!(
                level = WARN,
                mail = %mail.id,
                failures = mail.failures.len(),
                "Giving up after {} hours",
                relay.retry_hours
            );
            self.ndr(&mail).await;
            self.remove(&mail).await;
            return Ok(());
        }

        let Err(err) = self.send(&mail).await else {
            internal!(level = INFO, mail = %mail.id, "Delivered to {:?}", mail.recipients());
            self.remove(&mail).await;
            return Ok(());
        };

        let permanent = err.is_permanent();
        let now = Utc::now();
        mail.failures.push(Failure {
            date: now,
            error: err.to_string(),
            permanent,
        });
        mail.updated = now;

        if permanent {
            internal!(
                level = WARN,
                mail = %mail.id,
                failures = mail.failures.len(),
                "Permanent delivery failure: {err}"
            );
            self.ndr(&mail).await;
            self.remove(&mail).await;
            return Ok(());
        }

        let attempts = mail.failures.len() as u64;
        let retry = Duration::from_secs(
            attempts
                .saturating_mul(attempts)
                .saturating_mul(relay.retry_base_interval),
        );

        internal!(
            level = INFO,
            mail = %mail.id,
            failures = mail.failures.len(),
            "Delivery failed, retrying in {}s: {err}",
            retry.as_secs()
        );

        self.update(&mail).await?;
        self.queue.schedule(retry, mail);
        Ok(())
    }

    /// Tries the recipient domain's mail servers in order of preference.
    ///
    /// # Errors
    ///
    /// When every server failed. The error is permanent only if every
    /// server refused permanently.
    pub async fn send(&self, mail: &Mail) -> Result<(), RelayError> {
        let to = mail
            .recipients()
            .first()
            .ok_or_else(|| RelayError::InvalidEnvelope(String::from("missing recipient")))?;
        let domain = domain_of(to)
            .ok_or_else(|| RelayError::InvalidEnvelope(format!("no domain in {to}")))?;

        let message = match tokio::fs::read(&mail.file).await {
            Ok(message) => message,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RelayError::Delivery {
                    message: format!("message body {} is missing", mail.file.display()),
                    permanent: true,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let port = self.config.relay.smtp_port;
        let mut servers = match self.resolver.mx(domain).await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) | Err(_) => vec![MailServer::new(domain, 10, port)],
        };
        servers.sort_by_key(|server| server.priority);

        let mut errors: Vec<(String, RelayError)> = Vec::with_capacity(servers.len());
        for mut server in servers {
            server.port = port;

            let address = match self.resolver.ip(&server.host).await {
                Ok(ips) => ips.first().map(|ip| SocketAddr::new(*ip, port)),
                Err(err) => {
                    errors.push((server.host, RelayError::Dns(err)));
                    continue;
                }
            };

            let Some(address) = address else {
                let err = DnsError::DomainNotFound(server.host.clone());
                errors.push((server.host, RelayError::Dns(err)));
                continue;
            };

            internal!(
                level = DEBUG,
                mail = %mail.id,
                "Attempting delivery to {} ({address})",
                server.host
            );

            match self.deliver.deliver(&server, address, mail, &message).await {
                Ok(()) => return Ok(()),
                Err(err) => errors.push((server.host, err)),
            }
        }

        let permanent = !errors.is_empty() && errors.iter().all(|(_, err)| err.is_permanent());
        let message = errors
            .into_iter()
            .map(|(host, err)| format!("{host}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");

        Err(RelayError::Delivery { message, permanent })
    }

    /// Rewrites the record of `mail`.
    ///
    /// # Errors
    ///
    /// If it cannot be written.
    pub async fn update(&self, mail: &Mail) -> Result<(), RelayError> {
        mail.write().await
    }

    /// Deletes the body and record of `mail`. Files already gone are fine.
    pub async fn remove(&self, mail: &Mail) {
        for path in [&mail.file, &mail.meta] {
            if let Err(err) = tokio::fs::remove_file(path).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                internal!(
                    level = WARN,
                    mail = %mail.id,
                    "Failed to remove {}: {err}",
                    path.display()
                );
            }
        }
    }

    /// Bounces `mail` to its sender.
    pub async fn ndr(&self, mail: &Mail) {
        let original = tokio::fs::read(&mail.file).await.unwrap_or_default();

        let Some(message) = ndr::compose(mail, original) else {
            internal!(
                level = INFO,
                mail = %mail.id,
                "Not bouncing automatically generated mail from {}",
                mail.sender()
            );
            return;
        };

        internal!(level = INFO, mail = %mail.id, "Sending ndr to {}", mail.sender());
        if let Err(err) = self.notify.notify(message).await {
            internal!(
                level = ERROR,
                mail = %mail.id,
                "Failed to send ndr to {}: {err:#}",
                mail.sender()
            );
        }
    }
}

async fn store(source: &Path, mail: &Mail) -> Result<(), RelayError> {
    tokio::fs::copy(source, &mail.file).await?;
    mail.write().await
}

#[cfg(test)]
mod test;
