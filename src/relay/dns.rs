//! Name resolution for delivery and for naming connected clients.

use std::{
    collections::HashMap,
    net::IpAddr,
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::internal;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

/// A mail exchanger for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// Lower is preferred.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16, port: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port,
        }
    }
}

#[async_trait]
pub trait Resolve: Send + Sync {
    /// MX hosts for `domain`, in no particular order.
    async fn mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError>;

    async fn ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;

    /// Reverse name of `ip`, if it has one.
    async fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver backed by the system's DNS configuration.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// # Errors
    ///
    /// If the system resolver configuration cannot be read.
    pub fn new() -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver })
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let servers: Vec<MailServer> = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MailServer::new(host.trim_end_matches('.'), mx.preference(), 25)
                    })
                    .collect();

                if servers.is_empty() {
                    return Err(DnsError::NoMailServers(domain.to_string()));
                }

                Ok(servers)
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }

    async fn ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(host.to_string())),
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }

    async fn reverse(&self, ip: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
            Err(err) => {
                internal!(level = DEBUG, "Reverse lookup for {ip} failed: {err}");
                None
            }
        }
    }
}

/// Fixed answers, for embedding in closed networks and for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    mx: HashMap<String, Vec<MailServer>>,
    ip: HashMap<String, Vec<IpAddr>>,
    reverse: HashMap<IpAddr, String>,
}

impl StaticResolver {
    #[must_use]
    pub fn with_mx(mut self, domain: &str, servers: Vec<MailServer>) -> Self {
        self.mx.insert(domain.to_ascii_lowercase(), servers);
        self
    }

    #[must_use]
    pub fn with_ip(mut self, host: &str, ips: Vec<IpAddr>) -> Self {
        self.ip.insert(host.to_ascii_lowercase(), ips);
        self
    }

    #[must_use]
    pub fn with_reverse(mut self, ip: IpAddr, name: &str) -> Self {
        self.reverse.insert(ip, name.to_string());
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        self.mx
            .get(&domain.to_ascii_lowercase())
            .filter(|servers| !servers.is_empty())
            .cloned()
            .ok_or_else(|| DnsError::NoMailServers(domain.to_string()))
    }

    async fn ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        self.ip
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DnsError::DomainNotFound(host.to_string()))
    }

    async fn reverse(&self, ip: IpAddr) -> Option<String> {
        self.reverse.get(&ip).cloned()
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn static_answers() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let resolver = StaticResolver::default()
            .with_mx("Example.com", vec![MailServer::new("mx.example.com", 10, 25)])
            .with_ip("mx.example.com", vec![localhost])
            .with_reverse(localhost, "localhost");

        assert_eq!(
            resolver.mx("example.com").await.unwrap(),
            vec![MailServer::new("mx.example.com", 10, 25)]
        );
        assert!(matches!(
            resolver.mx("example.org").await,
            Err(DnsError::NoMailServers(_))
        ));
        assert_eq!(resolver.ip("mx.example.com").await.unwrap(), vec![localhost]);
        assert_eq!(resolver.ip("10.0.0.1").await.unwrap().len(), 1);
        assert_eq!(resolver.reverse(localhost).await.as_deref(), Some("localhost"));
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn resolves_real_mx() {
        let resolver = DnsResolver::new().unwrap();
        let servers = resolver.mx("gmail.com").await.unwrap();
        assert!(!servers.is_empty());
    }
}
