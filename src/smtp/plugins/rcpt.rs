use async_trait::async_trait;

use super::{
    domain_of,
    mail::{normalise, parse_address},
};
use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        if !res.session.is_accepted("mail") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "need MAIL command",
            ));
        }

        let Some(text) = req.command.text() else {
            return Ok(Verdict::reject(
                Status::InvalidArguments,
                "incomplete RCPT command",
            ));
        };

        if res.session.envelope.to.len() >= res.session.config().limits.max_recipients {
            return Ok(Verdict::reject(
                Status::NotImplemented,
                "too many recipients",
            ));
        }

        let Some(address) = parse_address(text, "to") else {
            return Ok(Verdict::reject(
                Status::InvalidArguments,
                "parse error in rcpt command",
            ));
        };

        let to = normalise(address);
        if to.is_empty() {
            return Ok(Verdict::reject(Status::InvalidArguments, "bad syntax"));
        }

        req.to = Some(to);
        Ok(Verdict::accept())
    }
}

/// Refuses recipients this server must not relay to.
///
/// Mail for a foreign domain needs an authenticated local sender, unless
/// unauthenticated relaying or open relaying is configured. Mail between
/// two local addresses needs authentication, as it can only come from a
/// local user.
pub struct Relay;

#[async_trait]
impl Handler for Relay {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        let config = res.session.config();
        let relay = &config.relay;

        if !relay.enabled {
            return Ok(Verdict::accept());
        }

        let is_local = |address: Option<&str>| {
            address
                .and_then(domain_of)
                .is_some_and(|domain| config.is_local(domain))
        };

        let from_local = is_local(res.session.envelope.from.as_deref());
        let to_local = is_local(req.to.as_deref());
        let authenticated = relay.allow_unauthenticated || res.session.is_accepted("auth");

        let denied = if to_local {
            from_local && !authenticated
        } else {
            !authenticated || (!relay.open_relay && !from_local)
        };

        if denied {
            res.debug(format_args!(
                "Denying relay from {:?} to {:?}",
                res.session.envelope.from, req.to
            ));
            return Ok(Verdict::reject(Status::NotImplemented, "relay access denied"));
        }

        Ok(Verdict::accept())
    }
}
