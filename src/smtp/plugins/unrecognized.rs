use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

/// Rejects unknown commands, and drops clients that keep sending them.
pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        res.session.counters.unrecognized_commands += 1;

        if res.session.counters.unrecognized_commands
            > res.session.config().limits.unrecognized_commands
        {
            return Ok(Verdict::end(
                Status::TransactionFailed,
                "error: too many unrecognized commands",
            ));
        }

        Ok(Verdict::reject(
            Status::NotImplemented,
            "command not recognized",
        ))
    }
}
