use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        if req.command.text().is_none() {
            return Ok(Verdict::reject(
                Status::InvalidArguments,
                "syntax: HELO hostname",
            ));
        }

        res.session.reset();

        Ok(Verdict::accept_with(
            Status::Ok,
            res.session.config().hostname.clone(),
        ))
    }
}
