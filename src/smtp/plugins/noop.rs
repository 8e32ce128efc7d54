use async_trait::async_trait;

use crate::smtp::handler::{Handler, Request, Response, Verdict};

pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, _res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        Ok(Verdict::accept())
    }
}
