use std::{panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;

use super::Session;
use crate::{
    error::SessionResult,
    internal,
    smtp::{
        command::{Command, Payload},
        handler::{Continuation, HandlerDef, Reply, Request, Response, Transition, Verdict},
    },
    status::Status,
};

/// How a dispatched event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Refused because the session was busy.
    Busy,
    /// Every handler accepted.
    Accepted,
    /// A handler accepted and skipped the rest of the chain.
    Final,
    Rejected,
    /// The connection was closed.
    Ended,
    /// A handler is waiting for the next raw line.
    Reading,
}

/// A chain walk in progress.
pub(super) struct ChainState {
    handlers: Vec<HandlerDef>,
    position: usize,
    request: Request,
    /// Sent when the chain is exhausted.
    reply: Reply,
    transition: Option<Transition>,
}

/// A chain suspended until the client sends another line.
pub(super) struct Pending {
    chain: ChainState,
    continuation: Box<dyn Continuation>,
}

impl Pending {
    pub(super) fn command(&self) -> &str {
        &self.chain.request.command.name
    }

    pub(super) fn into_parts(self) -> (ChainState, Box<dyn Continuation>) {
        (self.chain, self.continuation)
    }
}

impl<Stream> Session<Stream>
where
    Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync,
{
    /// Runs the chain for `name`. Internal events may use the reserved
    /// names and are dispatched even while the session is busy.
    ///
    /// # Errors
    ///
    /// If a reply cannot be written.
    pub async fn emit(
        &mut self,
        name: &str,
        data: Payload,
        internal: bool,
    ) -> SessionResult<Outcome> {
        self.dispatch(Command::new(name, data), internal).await
    }

    pub(super) async fn dispatch(
        &mut self,
        mut command: Command,
        internal: bool,
    ) -> SessionResult<Outcome> {
        if self.context.busy && !internal {
            internal!(
                level = DEBUG,
                session = %self.context.id,
                "Ignoring {} while busy",
                command.name
            );
            return Ok(Outcome::Busy);
        }

        let known = self.handlers.contains(&command.name) || self.overlay.contains(&command.name);
        if !known || (command.is_reserved() && !internal) {
            command = command.unrecognized();
        }

        let handlers = self.overlay.chain(&self.handlers, &command.name);
        if handlers.is_empty() {
            self.send(&format!("{} Error: command not recognized", Status::NotImplemented))
                .await?;
            return Ok(Outcome::Rejected);
        }

        let chain = ChainState {
            handlers,
            position: 0,
            request: Request::new(command, internal),
            reply: Reply::default(),
            transition: None,
        };

        self.walk(chain, None).await
    }

    /// Hands `line` to the handler waiting for it, then carries on with the
    /// rest of its chain.
    pub(super) async fn resume(&mut self, pending: Pending, line: String) -> SessionResult<Outcome> {
        let (chain, continuation) = pending.into_parts();
        self.walk(chain, Some((continuation, line))).await
    }

    async fn walk(
        &mut self,
        mut chain: ChainState,
        mut resume: Option<(Box<dyn Continuation>, String)>,
    ) -> SessionResult<Outcome> {
        let server = Arc::clone(&self.server);
        let command = chain.request.command.name.clone();

        loop {
            let Some(def) = chain.handlers.get(chain.position).cloned() else {
                return self.exhausted(chain).await;
            };

            let settings = server.config().plugin(&command, &def.name);

            let result = {
                let mut res = Response::new(
                    &mut self.context,
                    &command,
                    &def.name,
                    settings,
                    &mut self.output,
                    &mut chain.transition,
                );

                let future = match resume.take() {
                    Some((continuation, line)) => {
                        continuation.resume(line, &mut chain.request, &mut res)
                    }
                    None => def.handler.handle(&mut chain.request, &mut res),
                };

                AssertUnwindSafe(future).catch_unwind().await
            };

            let verdict = match result {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(err)) => {
                    internal!(
                        level = ERROR,
                        session = %self.context.id,
                        "Handler {command}/{} failed: {err:#}",
                        def.name
                    );
                    Verdict::end(Status::SyntaxError, "Error: Internal server error")
                }
                Err(_) => {
                    internal!(
                        level = ERROR,
                        session = %self.context.id,
                        "Handler {command}/{} panicked",
                        def.name
                    );
                    Verdict::end(Status::SyntaxError, "Error: Internal server error")
                }
            };

            self.flush().await?;

            match verdict {
                Verdict::Accept(reply) => {
                    if let Some(reply) = reply {
                        chain.reply = reply;
                    }
                    chain.position += 1;
                }
                Verdict::Final(reply) => {
                    let status = reply.as_ref().map_or(Status::Ok, |reply| reply.status);
                    self.context.accepted.insert(command, status.into());
                    if let Some(reply) = reply {
                        self.send(&reply).await?;
                    }
                    self.transition = chain.transition;
                    return Ok(Outcome::Final);
                }
                Verdict::Reject(reply) => return self.rejected(command, &reply).await,
                Verdict::End(reply) => {
                    self.context.rejected.insert(command, reply.status.into());
                    self.close(&reply).await?;
                    return Ok(Outcome::Ended);
                }
                Verdict::Read(continuation) => {
                    self.pending = Some(Pending {
                        chain,
                        continuation,
                    });
                    return Ok(Outcome::Reading);
                }
            }
        }
    }

    async fn rejected(&mut self, command: String, reply: &Reply) -> SessionResult<Outcome> {
        let auth = command == "auth";
        self.context.rejected.insert(command, reply.status.into());

        if auth {
            self.context.counters.auth_failures += 1;
            if self.context.counters.auth_failures > self.server.config().limits.auth_failures {
                let reply = Reply::new(
                    Status::TransactionFailed,
                    "Error: Too many failed authentications",
                );
                self.close(&reply).await?;
                return Ok(Outcome::Ended);
            }
        }

        self.send(&format!("{} Error: {}", reply.status, reply.message))
            .await?;
        Ok(Outcome::Rejected)
    }

    /// Every handler accepted: record the command and apply its effect on
    /// the session.
    async fn exhausted(&mut self, chain: ChainState) -> SessionResult<Outcome> {
        let ChainState {
            request,
            reply,
            transition,
            ..
        } = chain;

        match request.command.name.as_str() {
            "mail" => {
                if let Some(from) = request.from {
                    self.context.envelope.from = Some(from);
                }
            }
            "rcpt" => {
                if let Some(to) = request.to {
                    self.context.envelope.add_recipient(to);
                }
            }
            "auth" => {
                if let Some(user) = request.user {
                    self.context.user = Some(user);
                }
            }
            _ => {}
        }

        self.context
            .accepted
            .insert(request.command.name, reply.status.into());

        self.send(&reply).await?;
        self.transition = transition;
        Ok(Outcome::Accepted)
    }
}
