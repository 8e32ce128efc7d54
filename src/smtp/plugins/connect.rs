use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

/// Greets the client, or turns it away when the server is full.
pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        let config = res.session.config();
        let connections = res.session.server().connections();

        if connections > config.limits.max_connections {
            res.info(format_args!("Refusing client, {connections} connections open"));
            return Ok(Verdict::end(
                Status::Unavailable,
                format!(
                    "{} too many connected clients, try again in a moment",
                    config.hostname
                ),
            ));
        }

        Ok(Verdict::accept_with(
            Status::ServiceReady,
            format!("{} {}", config.hostname, config.greeting),
        ))
    }
}
