//! `AUTH PLAIN` and `AUTH LOGIN`.
//!
//! This handler only decodes credentials into `req.user`. Handlers added
//! after it verify them and reject with 535 when they do not match. The
//! server's own API user is accepted here and ends the chain.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};

use crate::{
    smtp::{
        context::User,
        handler::{Handler, Request, Response, Verdict},
    },
    status::Status,
};

const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

pub struct Core;

fn decode(line: &str) -> String {
    STANDARD
        .decode(line.trim())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn aborted(line: &str) -> bool {
    line.trim() == "*"
}

/// `[authzid] NUL authcid NUL passwd`
fn plain(token: &str) -> Option<User> {
    let decoded = decode(token);
    let fields: Vec<&str> = decoded.split('\0').collect();

    let (username, password) = match fields.as_slice() {
        [username, password] | [_, username, password] => (*username, *password),
        _ => return None,
    };

    if username.is_empty() || password.is_empty() {
        return None;
    }

    Some(User::new(username, password))
}

fn authenticate(user: User, req: &mut Request, res: &Response<'_>) -> Verdict {
    if res.session.server().is_api_user(&user) {
        res.debug("Authenticated as the API user, skipping remaining handlers");
        req.user = Some(user);
        return Verdict::finish(Status::AuthSuccess, "authentication successful (api user)");
    }

    req.user = Some(user);
    Verdict::accept_with(Status::AuthSuccess, "authentication successful")
}

fn complete_plain(token: &str, req: &mut Request, res: &Response<'_>) -> Verdict {
    if aborted(token) {
        return Verdict::reject(Status::InvalidArguments, "authentication aborted");
    }

    match plain(token) {
        Some(user) => authenticate(user, req, res),
        None => Verdict::reject(Status::SyntaxError, "invalid user data"),
    }
}

#[async_trait]
impl Handler for Core {
    async fn handle(&self, req: &mut Request, res: &mut Response<'_>) -> anyhow::Result<Verdict> {
        if res.session.is_accepted("auth") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "already authenticated",
            ));
        }

        if res.session.is_accepted("mail") {
            return Ok(Verdict::reject(
                Status::InvalidCommandSequence,
                "not permitted",
            ));
        }

        let Some(text) = req.command.text() else {
            return Ok(Verdict::reject(Status::InvalidArguments, "bad syntax"));
        };

        let mut arguments = text.split_whitespace();
        let mechanism = arguments.next().unwrap_or_default().to_ascii_lowercase();
        let initial = arguments.next().map(str::to_string);

        if arguments.next().is_some() {
            return Ok(Verdict::reject(Status::InvalidArguments, "bad syntax"));
        }

        match (mechanism.as_str(), initial) {
            ("plain", Some(token)) => Ok(complete_plain(&token, req, res)),
            ("plain", None) => {
                res.write(format!("{} ", Status::AuthContinue));
                Ok(Verdict::read(|line, req, res| {
                    Ok(complete_plain(&line, req, res))
                }))
            }
            ("login", None) => {
                res.write(format!("{} {USERNAME_PROMPT}", Status::AuthContinue));
                Ok(Verdict::read(|line, _req, res| {
                    if aborted(&line) {
                        return Ok(Verdict::reject(
                            Status::InvalidArguments,
                            "authentication aborted",
                        ));
                    }

                    let username = decode(&line);
                    res.write(format!("{} {PASSWORD_PROMPT}", Status::AuthContinue));

                    Ok(Verdict::read(move |line, req, res| {
                        if aborted(&line) {
                            return Ok(Verdict::reject(
                                Status::InvalidArguments,
                                "authentication aborted",
                            ));
                        }

                        Ok(authenticate(User::new(username, decode(&line)), req, res))
                    }))
                }))
            }
            _ => Ok(Verdict::reject(Status::InvalidArguments, "bad syntax")),
        }
    }
}
