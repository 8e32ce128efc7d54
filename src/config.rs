//! Server configuration.
//!
//! Every field carries a serde default, so an empty RON document `()` is a
//! valid configuration. Plugin specific settings live in `plugins`, keyed by
//! `"<command>/<plugin>"`; a value of `false` disables that handler.

use std::{collections::HashMap, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::smtp::connection::TlsContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name announced in greetings and `Received` headers.
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    /// Text following the hostname in the `220` greeting.
    #[serde(default = "defaults::greeting")]
    pub greeting: String,

    /// Domains this server accepts mail for. Derived from `hostname` when empty.
    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default)]
    pub listen: Listen,

    #[serde(default)]
    pub tls: Option<TlsContext>,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub limits: Limits,

    /// Where message bodies are written while `DATA` is received.
    #[serde(default = "defaults::spool_dir")]
    pub spool_dir: PathBuf,

    #[serde(default)]
    pub plugins: HashMap<String, Value>,
}

/// Listening sockets. `smtp` and `submission` speak plain SMTP with
/// STARTTLS, `smtps` wraps every connection in TLS from the first byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listen {
    #[serde(default = "defaults::smtp")]
    pub smtp: Option<SocketAddr>,
    #[serde(default = "defaults::submission")]
    pub submission: Option<SocketAddr>,
    #[serde(default)]
    pub smtps: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Name used in the outbound `EHLO`. Falls back to the server hostname.
    #[serde(default)]
    pub hostname: String,

    #[serde(default = "defaults::queue_dir")]
    pub queue_dir: PathBuf,

    /// How long delivery is attempted before the mail is bounced.
    #[serde(default = "defaults::retry_hours")]
    pub retry_hours: u64,

    /// Seconds; the n-th retry waits `n^2 * retry_base_interval`.
    #[serde(default = "defaults::retry_base_interval")]
    pub retry_base_interval: u64,

    #[serde(default = "defaults::concurrent_transactions")]
    pub concurrent_transactions: usize,

    #[serde(default)]
    pub allow_unauthenticated: bool,

    #[serde(default)]
    pub open_relay: bool,

    #[serde(default = "defaults::smtp_port")]
    pub smtp_port: u16,

    #[serde(default = "defaults::tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "defaults::timeout_secs")]
    pub greeting_timeout_secs: u64,

    #[serde(default = "defaults::timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Milliseconds without a complete line before the `timeout` event fires.
    #[serde(default = "defaults::idle_timeout")]
    pub idle_timeout: u64,

    /// Bytes.
    #[serde(default = "defaults::message_size")]
    pub message_size: usize,

    #[serde(default = "defaults::auth_failures")]
    pub auth_failures: u32,

    #[serde(default = "defaults::unrecognized_commands")]
    pub unrecognized_commands: u32,

    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,

    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: defaults::hostname(),
            greeting: defaults::greeting(),
            domains: Vec::default(),
            listen: Listen::default(),
            tls: None,
            relay: RelayConfig::default(),
            limits: Limits::default(),
            spool_dir: defaults::spool_dir(),
            plugins: HashMap::default(),
        }
        .normalised()
    }
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            smtp: defaults::smtp(),
            submission: defaults::submission(),
            smtps: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            hostname: String::default(),
            queue_dir: defaults::queue_dir(),
            retry_hours: defaults::retry_hours(),
            retry_base_interval: defaults::retry_base_interval(),
            concurrent_transactions: defaults::concurrent_transactions(),
            allow_unauthenticated: false,
            open_relay: false,
            smtp_port: defaults::smtp_port(),
            tick_interval_ms: defaults::tick_interval_ms(),
            greeting_timeout_secs: defaults::timeout_secs(),
            command_timeout_secs: defaults::timeout_secs(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            idle_timeout: defaults::idle_timeout(),
            message_size: defaults::message_size(),
            auth_failures: defaults::auth_failures(),
            unrecognized_commands: defaults::unrecognized_commands(),
            max_connections: defaults::max_connections(),
            max_recipients: defaults::max_recipients(),
        }
    }
}

impl Config {
    /// Parses a RON document and fills in the derived fields.
    ///
    /// # Errors
    ///
    /// If the document is not valid RON for this structure.
    pub fn from_ron(document: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str::<Self>(document).map(Self::normalised)
    }

    /// Fills `domains` and `relay.hostname` from `hostname` when they were
    /// not configured, and lowercases the served domains.
    #[must_use]
    pub fn normalised(mut self) -> Self {
        if self.domains.is_empty() {
            let domain = self
                .hostname
                .split_once('.')
                .map_or(self.hostname.as_str(), |(_, domain)| domain);
            self.domains.push(domain.to_string());
        }

        for domain in &mut self.domains {
            *domain = domain.to_ascii_lowercase();
        }

        if self.relay.hostname.is_empty() {
            self.relay.hostname.clone_from(&self.hostname);
        }

        self
    }

    /// Whether `domain` is one this server receives mail for.
    #[must_use]
    pub fn is_local(&self, domain: &str) -> bool {
        self.domains
            .iter()
            .any(|local| local.eq_ignore_ascii_case(domain))
    }

    /// Whether the domain part of `address` is served locally.
    #[must_use]
    pub fn is_local_address(&self, address: &str) -> bool {
        address
            .rsplit_once('@')
            .is_some_and(|(_, domain)| self.is_local(domain))
    }

    /// Raw settings for one handler, `Value::Null` when there are none.
    #[must_use]
    pub fn plugin(&self, command: &str, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.plugins
            .get(&format!("{command}/{name}"))
            .unwrap_or(&NULL)
    }

    /// A handler configured as `false` is left out of its chain.
    #[must_use]
    pub fn is_disabled(&self, command: &str, name: &str) -> bool {
        matches!(self.plugin(command, name), Value::Bool(false))
    }
}

mod defaults {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        path::PathBuf,
    };

    pub fn hostname() -> String {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| String::from("localhost"))
    }

    pub fn greeting() -> String {
        String::from("courier")
    }

    #[allow(clippy::unnecessary_wraps)]
    pub const fn smtp() -> Option<SocketAddr> {
        Some(SocketAddr::new(
            std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            25,
        ))
    }

    #[allow(clippy::unnecessary_wraps)]
    pub const fn submission() -> Option<SocketAddr> {
        Some(SocketAddr::new(
            std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            587,
        ))
    }

    pub const fn enabled() -> bool {
        true
    }

    pub fn queue_dir() -> PathBuf {
        std::env::temp_dir().join("courier-queue")
    }

    pub fn spool_dir() -> PathBuf {
        std::env::temp_dir()
    }

    pub const fn retry_hours() -> u64 {
        48
    }

    pub const fn retry_base_interval() -> u64 {
        60
    }

    pub const fn concurrent_transactions() -> usize {
        5
    }

    pub const fn smtp_port() -> u16 {
        25
    }

    pub const fn tick_interval_ms() -> u64 {
        1000
    }

    pub const fn timeout_secs() -> u64 {
        120
    }

    pub const fn idle_timeout() -> u64 {
        60_000
    }

    pub const fn message_size() -> usize {
        100 * 1024 * 1024
    }

    pub const fn auth_failures() -> u32 {
        5
    }

    pub const fn unrecognized_commands() -> u32 {
        5
    }

    pub const fn max_connections() -> usize {
        100
    }

    pub const fn max_recipients() -> usize {
        100
    }
}
