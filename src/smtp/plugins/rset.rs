use async_trait::async_trait;

use crate::smtp::handler::{Handler, Request, Response, Verdict};

/// Clears the transaction only; greeting and authentication survive.
pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        res.session.reset_transaction();
        Ok(Verdict::accept())
    }
}
