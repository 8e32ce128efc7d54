use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        Ok(Verdict::end(
            Status::GoodBye,
            format!("{} closing connection", res.session.config().hostname),
        ))
    }
}
