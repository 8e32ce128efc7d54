//! The contract between a session and the handlers in its chains.
//!
//! A handler receives the [`Request`] built up so far by earlier handlers in
//! the same chain, and a [`Response`] through which it can write lines, read
//! and store session data and log. Its turn ends with the [`Verdict`] it
//! returns.

use std::{
    fmt::{self, Debug, Display, Formatter},
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::{
    command::Command,
    context::{Context, User},
};
use crate::{headers::Headers, status::Status};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict>;
}

/// Resumes a handler that asked for the next raw line from the client.
#[async_trait]
pub trait Continuation: Send {
    async fn resume(
        self: Box<Self>,
        line: String,
        req: &mut Request,
        res: &mut Response<'_>,
    ) -> anyhow::Result<Verdict>;
}

/// A named handler and its ordering constraints within one command's chain.
#[derive(Clone)]
pub struct HandlerDef {
    pub name: String,
    pub after: Vec<String>,
    pub before: Vec<String>,
    pub handler: Arc<dyn Handler>,
}

impl HandlerDef {
    pub fn new(name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self {
            name: name.into(),
            after: Vec::default(),
            before: Vec::default(),
            handler: Arc::new(handler),
        }
    }

    /// Plugins (names, optionally `command/` qualified) that must run first.
    #[must_use]
    pub fn after<S: Into<String>>(mut self, plugins: impl IntoIterator<Item = S>) -> Self {
        self.after.extend(plugins.into_iter().map(Into::into));
        self
    }

    /// Plugins that must run after this one.
    #[must_use]
    pub fn before<S: Into<String>>(mut self, plugins: impl IntoIterator<Item = S>) -> Self {
        self.before.extend(plugins.into_iter().map(Into::into));
        self
    }
}

impl Debug for HandlerDef {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("HandlerDef")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("before", &self.before)
            .finish_non_exhaustive()
    }
}

/// Adapts a plain function or closure into a [`Handler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Request, &mut Response<'_>) -> anyhow::Result<Verdict> + Send + Sync + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Request, &mut Response<'_>) -> anyhow::Result<Verdict> + Send + Sync + 'static,
{
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        (self.0)(req, res)
    }
}

struct ReadFn<F>(F);

#[async_trait]
impl<F> Continuation for ReadFn<F>
where
    F: FnOnce(String, &mut Request, &mut Response<'_>) -> anyhow::Result<Verdict> + Send + 'static,
{
    async fn resume(
        self: Box<Self>,
        line: String,
        req: &mut Request,
        res: &mut Response<'_>,
    ) -> anyhow::Result<Verdict> {
        (self.0)(line, req, res)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub message: String,
}

impl Reply {
    pub fn new(status: impl Into<Status>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }
}

impl Default for Reply {
    fn default() -> Self {
        Self::new(Status::Ok, "OK")
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {}", self.status, self.message)
    }
}

/// How a handler's turn ended.
pub enum Verdict {
    /// Continue with the next handler, optionally replacing the reply sent
    /// once the chain is exhausted.
    Accept(Option<Reply>),
    /// Accept the command and skip the rest of the chain. The reply, if any,
    /// is written immediately.
    Final(Option<Reply>),
    /// Refuse the command; written as `<code> Error: <message>`.
    Reject(Reply),
    /// Write the reply and close the connection.
    End(Reply),
    /// Hand the next raw line to the continuation instead of dispatching it.
    Read(Box<dyn Continuation>),
}

impl Verdict {
    pub const fn accept() -> Self {
        Self::Accept(None)
    }

    pub fn accept_with(status: impl Into<Status>, message: impl Into<String>) -> Self {
        Self::Accept(Some(Reply::new(status, message)))
    }

    pub fn finish(status: impl Into<Status>, message: impl Into<String>) -> Self {
        Self::Final(Some(Reply::new(status, message)))
    }

    pub fn reject(status: impl Into<Status>, message: impl Into<String>) -> Self {
        Self::Reject(Reply::new(status, message))
    }

    pub fn end(status: impl Into<Status>, message: impl Into<String>) -> Self {
        Self::End(Reply::new(status, message))
    }

    pub fn read<F>(continuation: F) -> Self
    where
        F: FnOnce(String, &mut Request, &mut Response<'_>) -> anyhow::Result<Verdict>
            + Send
            + 'static,
    {
        Self::Read(Box::new(ReadFn(continuation)))
    }
}

impl Debug for Verdict {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept(reply) => fmt.debug_tuple("Accept").field(reply).finish(),
            Self::Final(reply) => fmt.debug_tuple("Final").field(reply).finish(),
            Self::Reject(reply) => fmt.debug_tuple("Reject").field(reply).finish(),
            Self::End(reply) => fmt.debug_tuple("End").field(reply).finish(),
            Self::Read(_) => fmt.write_str("Read"),
        }
    }
}

/// A change of transport mode, carried out by the session once the reply
/// accepting the command has been flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Data,
    StartTls,
}

/// State accumulated while walking one command's chain.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    /// Emitted by the server rather than sent by the client.
    pub internal: bool,
    pub user: Option<User>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub file: Option<PathBuf>,
    pub mail: Option<Headers>,
}

impl Request {
    pub const fn new(command: Command, internal: bool) -> Self {
        Self {
            command,
            internal,
            user: None,
            from: None,
            to: None,
            file: None,
            mail: None,
        }
    }
}

pub struct Response<'a> {
    pub session: &'a mut Context,
    command: &'a str,
    plugin: &'a str,
    settings: &'a Value,
    output: &'a mut Vec<String>,
    transition: &'a mut Option<Transition>,
}

macro_rules! handler_log {
    ($($name:ident => $level:ident),+) => {
        $(
            pub fn $name(&self, message: impl Display) {
                $crate::internal!(
                    level = $level,
                    session = %self.session.id,
                    transaction = self.session.transaction,
                    command = self.command,
                    plugin = self.plugin,
                    "{message}"
                );
            }
        )+
    };
}

impl<'a> Response<'a> {
    pub(crate) fn new(
        session: &'a mut Context,
        command: &'a str,
        plugin: &'a str,
        settings: &'a Value,
        output: &'a mut Vec<String>,
        transition: &'a mut Option<Transition>,
    ) -> Self {
        Self {
            session,
            command,
            plugin,
            settings,
            output,
            transition,
        }
    }

    pub const fn command(&self) -> &str {
        self.command
    }

    pub const fn plugin(&self) -> &str {
        self.plugin
    }

    /// Queues a raw protocol line without ending the handler's turn.
    pub fn write(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    /// Stores `value` under this command and plugin for later handlers.
    ///
    /// # Errors
    ///
    /// If `value` cannot be represented as JSON.
    pub fn set<T: Serialize>(&mut self, value: T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.session
            .data
            .entry(self.command.to_string())
            .or_default()
            .insert(self.plugin.to_string(), value);
        Ok(())
    }

    /// Looks up `"command/plugin"`, or every plugin's data for `"command"`.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key.split_once('/') {
            Some((command, plugin)) => self.session.data.get(command)?.get(plugin).cloned(),
            None => self.session.data.get(key).map(|plugins| {
                Value::Object(
                    plugins
                        .iter()
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                )
            }),
        }
    }

    /// The raw `plugins["command/plugin"]` settings.
    pub const fn settings(&self) -> &Value {
        self.settings
    }

    /// The plugin's settings as a typed value. Missing or invalid settings
    /// fall back to `T::default()`.
    pub fn config<T: DeserializeOwned + Default>(&self) -> T {
        if self.settings.is_null() {
            return T::default();
        }

        serde_json::from_value(self.settings.clone()).unwrap_or_else(|err| {
            self.warn(format_args!("Invalid settings, using defaults: {err}"));
            T::default()
        })
    }

    /// Switches the connection into message transfer once this command is
    /// accepted.
    pub fn start_data(&mut self) {
        *self.transition = Some(Transition::Data);
    }

    /// Upgrades the connection to TLS once this command is accepted.
    pub fn start_tls(&mut self) {
        *self.transition = Some(Transition::StartTls);
    }

    handler_log!(
        trace => TRACE,
        debug => DEBUG,
        info => INFO,
        warn => WARN,
        error => ERROR
    );
}
