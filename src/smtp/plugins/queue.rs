use async_trait::async_trait;

use super::domain_of;
use crate::{
    headers::Headers,
    smtp::{
        command::Payload,
        context::Envelope,
        handler::{Handler, Request, Response, Verdict},
    },
    status::Status,
};

/// Parses the spooled message's headers into `req.mail`.
pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        let Payload::File(path) = &req.command.data else {
            res.warn("Queue event without a message file");
            return Ok(Verdict::reject(
                Status::ActionUnavailable,
                "Error while processing the mail",
            ));
        };

        req.file = Some(path.clone());

        let message = match tokio::fs::read(path).await {
            Ok(message) => message,
            Err(err) => {
                res.warn(format_args!("Failed to read {}: {err}", path.display()));
                return Ok(Verdict::reject(
                    Status::ActionUnavailable,
                    "Error while processing the mail",
                ));
            }
        };

        match Headers::parse(&message) {
            Ok(headers) => {
                req.mail = Some(headers);
                Ok(Verdict::accept())
            }
            Err(err) => {
                res.warn(format_args!("Failed to parse mail: {err}"));
                Ok(Verdict::reject(
                    Status::ActionUnavailable,
                    "Error while parsing the mail",
                ))
            }
        }
    }
}

/// Hands mail for foreign recipients to the relay queue. Enqueue failures
/// are logged; the transaction is accepted either way.
pub struct Relay;

#[async_trait]
impl Handler for Relay {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        let server = std::sync::Arc::clone(res.session.server());
        let config = server.config();

        if !config.relay.enabled {
            return Ok(Verdict::accept());
        }

        if !config.relay.allow_unauthenticated && !res.session.is_accepted("auth") {
            return Ok(Verdict::accept());
        }

        let Some(from) = res.session.envelope.from.clone() else {
            return Ok(Verdict::accept());
        };

        let from_local = domain_of(&from).is_some_and(|domain| config.is_local(domain));
        if !config.relay.open_relay && !from_local {
            return Ok(Verdict::accept());
        }

        let to: Vec<String> = res
            .session
            .envelope
            .to
            .iter()
            .filter(|to| !config.is_local_address(to))
            .cloned()
            .collect();

        if to.is_empty() {
            return Ok(Verdict::accept());
        }

        let (Some(relay), Some(file)) = (server.relay(), req.file.as_ref()) else {
            res.warn("Relay queue unavailable, not relaying");
            return Ok(Verdict::accept());
        };

        res.debug(format_args!(
            "Relaying mail to {to:?}. Local domains: {}",
            config.domains.join(", ")
        ));

        let headers = req.mail.clone().unwrap_or_default();
        if let Err(err) = relay
            .add(&Envelope { from: Some(from), to }, file, headers)
            .await
        {
            res.error(format_args!("Failed to submit message to relay queue: {err}"));
        }

        Ok(Verdict::accept())
    }
}
