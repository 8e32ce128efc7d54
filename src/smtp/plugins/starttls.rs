use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

/// Accepts the upgrade; the handshake happens once `220` is flushed.
pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, _req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        if res.session.secure {
            return Ok(Verdict::reject(
                Status::TransactionFailed,
                "tls already active",
            ));
        }

        if !res.session.server().has_tls() {
            return Ok(Verdict::reject(
                Status::TlsUnavailable,
                "TLS not available",
            ));
        }

        res.start_tls();
        Ok(Verdict::accept_with(Status::ServiceReady, "OK"))
    }
}
