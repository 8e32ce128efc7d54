//! Composes RFC 5322 messages for the outbound API.

use std::fmt::Write;

use base64::{Engine, engine::general_purpose::STANDARD};

use super::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A message to submit through [`Server::send_mail`](crate::Server::send_mail).
///
/// `from` and `to` may use the `Name <address>` form; the envelope uses the
/// bare addresses.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    subject: Option<String>,
    text: Option<String>,
    html: Option<String>,
    headers: Vec<(String, String)>,
    attachments: Vec<Attachment>,
    identity: Option<String>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn attach(
        mut self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        });
        self
    }

    /// Tags the submission in logs, `api` when unset.
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn identity_tag(&self) -> &str {
        self.identity.as_deref().unwrap_or("api")
    }

    /// Envelope sender.
    ///
    /// # Errors
    ///
    /// If no sender was given.
    pub fn envelope_from(&self) -> Result<String> {
        self.from
            .as_deref()
            .map(address)
            .ok_or_else(|| ClientError::BuilderError(String::from("Missing sender")))
    }

    /// Envelope recipients.
    ///
    /// # Errors
    ///
    /// If there are none.
    pub fn envelope_to(&self) -> Result<Vec<String>> {
        if self.to.is_empty() {
            return Err(ClientError::BuilderError(String::from("Missing recipients")));
        }

        Ok(self.to.iter().map(|to| address(to)).collect())
    }

    /// Renders headers and body.
    ///
    /// # Errors
    ///
    /// If the sender or recipients are missing, or a header would span
    /// more than one line.
    pub fn build(&self) -> Result<String> {
        let from = self.envelope_from()?;
        self.envelope_to()?;
        self.check_header_lines()?;

        let domain = from.rsplit_once('@').map_or("localhost", |(_, domain)| domain);
        let mut message = String::with_capacity(1024);

        let _ = write!(message, "From: {}\r\n", self.from.as_deref().unwrap_or_default());
        let _ = write!(message, "To: {}\r\n", self.to.join(", "));
        if let Some(subject) = &self.subject {
            let _ = write!(message, "Subject: {subject}\r\n");
        }
        let _ = write!(message, "Date: {}\r\n", chrono::Utc::now().to_rfc2822());
        let _ = write!(message, "Message-ID: <{}@{domain}>\r\n", ulid::Ulid::new());
        for (name, value) in &self.headers {
            let _ = write!(message, "{name}: {value}\r\n");
        }
        message.push_str("MIME-Version: 1.0\r\n");

        if self.attachments.is_empty() {
            self.write_body(&mut message);
            return Ok(message);
        }

        let boundary = boundary();
        let _ = write!(
            message,
            "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"
        );

        let _ = write!(message, "--{boundary}\r\n");
        self.write_body(&mut message);
        message.push_str("\r\n");

        for attachment in &self.attachments {
            let _ = write!(
                message,
                "--{boundary}\r\nContent-Type: {}\r\nContent-Transfer-Encoding: base64\r\nContent-Disposition: attachment; filename=\"{}\"\r\n\r\n",
                attachment.content_type, attachment.filename
            );
            message.push_str(&encode(&attachment.data));
        }

        let _ = write!(message, "--{boundary}--\r\n");
        Ok(message)
    }

    /// Rejects line breaks in anything written into a header.
    fn check_header_lines(&self) -> Result<()> {
        let mut fields: Vec<(&str, &str)> = Vec::new();
        fields.extend(self.from.iter().map(|from| ("From", from.as_str())));
        fields.extend(self.to.iter().map(|to| ("To", to.as_str())));
        fields.extend(self.subject.iter().map(|subject| ("Subject", subject.as_str())));
        for (name, value) in &self.headers {
            fields.push((name.as_str(), name.as_str()));
            fields.push((name.as_str(), value.as_str()));
        }
        for attachment in &self.attachments {
            fields.push(("Content-Type", attachment.content_type.as_str()));
            fields.push(("Content-Disposition", attachment.filename.as_str()));
        }

        match fields.iter().find(|(_, value)| value.contains(['\r', '\n'])) {
            Some((name, _)) => Err(ClientError::BuilderError(format!(
                "Line break in the {name} header"
            ))),
            None => Ok(()),
        }
    }

    /// Content headers, a blank line and the text and/or HTML parts.
    fn write_body(&self, message: &mut String) {
        let text = self.text.as_deref().unwrap_or_default();

        let Some(html) = &self.html else {
            let _ = write!(
                message,
                "Content-Type: text/plain; charset=utf-8\r\n\r\n{}",
                crlf(text)
            );
            return;
        };

        let boundary = boundary();
        let _ = write!(
            message,
            "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
        );
        let _ = write!(
            message,
            "--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            crlf(text)
        );
        let _ = write!(
            message,
            "--{boundary}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{}\r\n",
            crlf(html)
        );
        let _ = write!(message, "--{boundary}--\r\n");
    }
}

/// Bare address from `Name <address>`.
fn address(mailbox: &str) -> String {
    match (mailbox.rfind('<'), mailbox.rfind('>')) {
        (Some(start), Some(end)) if start < end => mailbox[start + 1..end].trim().to_string(),
        _ => mailbox.trim().to_string(),
    }
}

fn boundary() -> String {
    format!("----=_Part_{}", ulid::Ulid::new())
}

fn crlf(text: &str) -> String {
    text.lines().collect::<Vec<_>>().join("\r\n")
}

/// Base64 wrapped at 76 columns.
fn encode(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / 38 + 2);

    for chunk in encoded.as_bytes().chunks(76) {
        wrapped.push_str(&String::from_utf8_lossy(chunk));
        wrapped.push_str("\r\n");
    }

    wrapped
}
