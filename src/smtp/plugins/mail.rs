use async_trait::async_trait;

use crate::{
    smtp::handler::{Handler, Request, Response, Verdict},
    status::Status,
};

pub struct Core;

/// `SIZE=<n>` from the parameters following the address.
fn declared_size(text: &str) -> Option<usize> {
    text.split_whitespace()
        .skip(1)
        .find_map(|param| {
            param
                .split_once('=')
                .filter(|(key, _)| key.eq_ignore_ascii_case("size"))
        })
        .and_then(|(_, value)| value.parse().ok())
}

/// `FROM:<address> [params]`, with `<>` kept as the null sender.
pub(crate) fn parse_address<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let (key, rest) = text.split_once(':')?;
    if !key.trim().eq_ignore_ascii_case(prefix) {
        return None;
    }

    rest.split_whitespace().next()
}

pub(crate) fn normalise(address: &str) -> String {
    let address = address.strip_prefix('<').unwrap_or(address);
    address.strip_suffix('>').unwrap_or(address).to_ascii_lowercase()
}

#[async_trait]
impl Handler for Core {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        if !res.session.is_accepted("helo") && !res.session.is_accepted("ehlo") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "Need HELO or EHLO command",
            ));
        }

        let Some(text) = req.command.text() else {
            return Ok(Verdict::reject(
                Status::InvalidArguments,
                "Incomplete MAIL command",
            ));
        };

        if res.session.is_accepted("mail") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "Nested MAIL command",
            ));
        }

        let limit = res.session.config().limits.message_size;
        if declared_size(text).is_some_and(|size| size > limit) {
            return Ok(Verdict::reject(
                Status::ExceededStorage,
                format!("Message size exceeds fixed maximum message size ({limit} bytes)"),
            ));
        }

        let from = match parse_address(text, "from") {
            Some("<>") => String::from("<>"),
            Some(address) => normalise(address),
            None => {
                return Ok(Verdict::reject(
                    Status::InvalidArguments,
                    "Parse error in mail command",
                ));
            }
        };

        if from.is_empty() {
            return Ok(Verdict::reject(Status::InvalidArguments, "Bad syntax"));
        }

        req.from = Some(from);
        Ok(Verdict::accept())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            parse_address("FROM:<Test@Example.com>", "from"),
            Some("<Test@Example.com>")
        );
        assert_eq!(
            parse_address("from : <a@b.c> SIZE=10", "from"),
            Some("<a@b.c>")
        );
        assert_eq!(parse_address("FROM: <>", "from"), Some("<>"));
        assert_eq!(parse_address("TO:<a@b.c>", "from"), None);
        assert_eq!(parse_address("FROM:", "from"), None);
        assert_eq!(parse_address("nothing", "from"), None);
    }

    #[test]
    fn normalises_addresses() {
        assert_eq!(normalise("<Test@Example.com>"), "test@example.com");
        assert_eq!(normalise("bare@example.com"), "bare@example.com");
        assert_eq!(normalise("<half@example.com"), "half@example.com");
    }

    #[test]
    fn reads_declared_size() {
        assert_eq!(declared_size("FROM:<a@b.c> SIZE=1024"), Some(1024));
        assert_eq!(declared_size("FROM:<a@b.c> BODY=8BITMIME size=7"), Some(7));
        assert_eq!(declared_size("FROM:<a@b.c>"), None);
        assert_eq!(declared_size("FROM:<a@b.c> SIZE=big"), None);
    }
}
