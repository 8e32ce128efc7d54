use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

/// Checks the transaction is complete and switches the connection into
/// message transfer. The session spools the message and emits `queue`.
pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        if !res.session.is_accepted("helo") && !res.session.is_accepted("ehlo") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "Need HELO or EHLO command",
            ));
        }

        if !res.session.is_accepted("mail") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "No valid sender",
            ));
        }

        if !res.session.is_accepted("rcpt") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "No valid recipients",
            ));
        }

        res.start_data();
        Ok(Verdict::accept_with(Status::StartMailInput, "OK"))
    }
}
