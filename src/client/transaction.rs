use std::net::SocketAddr;

use super::{
    error::Result,
    response::Response,
    smtp_client::{SmtpClient, Timeouts},
};
use crate::{internal, smtp::context::User};

/// Everything needed to hand one message to one server.
#[derive(Debug, Clone)]
pub struct Transaction<'a> {
    /// Tags log lines: `relay`, `ndr`, `api` or `client`.
    pub identity: &'a str,
    /// Name sent in `EHLO`.
    pub hostname: &'a str,
    /// Name of the server, for TLS.
    pub server_name: &'a str,
    /// Upgrade with `STARTTLS` when the server offers it.
    pub starttls: bool,
    pub auth: Option<&'a User>,
    pub from: &'a str,
    pub to: &'a [String],
    pub message: &'a [u8],
    pub timeouts: Timeouts,
}

impl Transaction<'_> {
    /// Runs greeting, `EHLO`, optional `STARTTLS` and `AUTH`, the envelope,
    /// and the message. Returns the reply to the end of data.
    ///
    /// # Errors
    ///
    /// The first step that fails, carrying the server's code when it
    /// refused something.
    pub async fn send(&self, address: SocketAddr) -> Result<Response> {
        let (mut client, _greeting) =
            SmtpClient::connect(address, self.server_name, self.identity, self.timeouts).await?;

        let result = self.run(&mut client).await;

        match &result {
            Ok(_) => {
                if let Err(err) = client.quit().await {
                    internal!(
                        level = DEBUG,
                        transaction = %client.id(),
                        "QUIT after delivery failed: {err}"
                    );
                }
            }
            Err(err) => {
                internal!(
                    level = DEBUG,
                    transaction = %client.id(),
                    identity = %self.identity,
                    "Transaction with {address} failed: {err}"
                );
                let _ = client.quit().await;
            }
        }

        result
    }

    async fn run(&self, client: &mut SmtpClient) -> Result<Response> {
        let ehlo = client.ehlo(self.hostname).await?;

        if self.starttls && ehlo.has_extension("STARTTLS") {
            client.starttls().await?;
            client.ehlo(self.hostname).await?;
        }

        if let Some(user) = self.auth {
            client.auth_plain(&user.username, &user.password).await?;
        }

        client.mail_from(self.from).await?;
        for to in self.to {
            client.rcpt_to(to).await?;
        }
        client.data().await?;
        client.send_data(self.message).await
    }
}
