use std::time::Duration;

use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        let idle = Duration::from_millis(res.session.config().limits.idle_timeout);

        Ok(Verdict::end(
            Status::ActionUnavailable,
            format!(
                "idle timeout ({}s) expired - closing connection",
                idle.as_secs_f64()
            ),
        ))
    }
}
