use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default = "features")]
    features: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            features: features(),
        }
    }
}

fn features() -> Vec<String> {
    ["STARTTLS", "AUTH LOGIN PLAIN", "8BITMIME", "PIPELINING", "SIZE"]
        .map(String::from)
        .to_vec()
}

/// Greets the client and advertises the configured extensions, one per line.
pub struct Core;

#[async_trait]
impl Handler for Core {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        if req.command.text().is_none() {
            return Ok(Verdict::reject(
                Status::InvalidArguments,
                "syntax: EHLO hostname",
            ));
        }

        res.session.reset();

        let settings: Settings = res.config();
        let secure = res.session.secure;
        let tls = res.session.server().has_tls();
        let hostname = res.session.config().hostname.clone();
        let size = res.session.config().limits.message_size;

        let features: Vec<String> = settings
            .features
            .into_iter()
            .filter(|feature| !feature.eq_ignore_ascii_case("STARTTLS") || (tls && !secure))
            .map(|feature| {
                if feature.eq_ignore_ascii_case("SIZE") {
                    format!("SIZE {size}")
                } else {
                    feature
                }
            })
            .collect();

        let Some((last, rest)) = features.split_last() else {
            return Ok(Verdict::accept_with(Status::Ok, hostname));
        };

        res.write(format!("{}-{hostname}", Status::Ok));
        for feature in rest {
            res.write(format!("{}-{feature}", Status::Ok));
        }

        Ok(Verdict::accept_with(Status::Ok, last.clone()))
    }
}
