use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    net::IpAddr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::command::TRANSACTION;
use crate::{Config, server::Server};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    /// Reverse DNS name, or `[<ip>]` when the address does not resolve.
    pub hostname: String,
    pub address: IpAddr,
}

/// Addressing of the mail transaction in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Option<String>,
    pub to: Vec<String>,
}

impl Envelope {
    /// Adds a recipient unless it is already present.
    pub fn add_recipient(&mut self, to: impl Into<String>) -> bool {
        let to = to.into();
        if self.to.contains(&to) {
            false
        } else {
            self.to.push(to);
            true
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub auth_failures: u32,
    pub unrecognized_commands: u32,
}

/// Session state visible to handlers.
///
/// Handlers enforce their own preconditions by looking at what was
/// `accepted` or `rejected` earlier in the session.
pub struct Context {
    pub id: String,
    pub client: Client,
    pub local: IpAddr,
    pub secure: bool,
    /// Completed `DATA` transfers in this session.
    pub transaction: u64,
    pub envelope: Envelope,
    pub accepted: HashMap<String, u32>,
    pub rejected: HashMap<String, u32>,
    pub user: Option<User>,
    /// Handler data, by command then plugin.
    pub data: HashMap<String, HashMap<String, Value>>,
    pub counters: Counters,
    pub(crate) busy: bool,
    server: Arc<Server>,
}

impl Context {
    pub(crate) fn new(server: Arc<Server>, client: Client, local: IpAddr) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            client,
            local,
            secure: false,
            transaction: 0,
            envelope: Envelope::default(),
            accepted: HashMap::default(),
            rejected: HashMap::default(),
            user: None,
            data: HashMap::default(),
            counters: Counters::default(),
            busy: false,
            server,
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn config(&self) -> &Config {
        self.server.config()
    }

    pub fn is_accepted(&self, command: &str) -> bool {
        self.accepted.contains_key(command)
    }

    pub fn is_rejected(&self, command: &str) -> bool {
        self.rejected.contains_key(command)
    }

    pub const fn is_busy(&self) -> bool {
        self.busy
    }

    /// Forgets everything learned since the connection was opened: greeting,
    /// authentication and the current transaction.
    pub fn reset(&mut self) {
        self.accepted.clear();
        self.rejected.clear();
        self.envelope = Envelope::default();
        self.user = None;
    }

    /// Clears the current mail transaction, keeping greeting and
    /// authentication state.
    pub fn reset_transaction(&mut self) {
        self.envelope = Envelope::default();
        for command in TRANSACTION {
            self.accepted.remove(command);
        }
    }
}

impl Debug for Context {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Context")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("secure", &self.secure)
            .field("transaction", &self.transaction)
            .field("envelope", &self.envelope)
            .field("accepted", &self.accepted)
            .field("rejected", &self.rejected)
            .field("user", &self.user.as_ref().map(|user| &user.username))
            .finish_non_exhaustive()
    }
}
