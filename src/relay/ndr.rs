//! Non delivery reports.

use super::mail::Mail;
use crate::client::MessageBuilder;

/// The bounce for `mail`, or `None` when it must not get one: mail that was
/// itself generated automatically, and mail from the null sender.
pub fn compose(mail: &Mail, original: Vec<u8>) -> Option<MessageBuilder> {
    if mail.headers.contains("Auto-Submitted") {
        return None;
    }

    let sender = mail.sender();
    let (_, domain) = sender.rsplit_once('@')?;

    let recipients = mail.recipients().join(", ");
    let reason = mail
        .last_failure()
        .map_or("Delivery time expired", |failure| failure.error.as_str());

    Some(
        MessageBuilder::new()
            .identity("ndr")
            .from(format!("Mail Delivery System <MAILER-DAEMON@{domain}>"))
            .to(sender)
            .header("Auto-Submitted", "auto-replied")
            .subject(format!(
                "Mail delivery to {recipients} failed: returning message to sender"
            ))
            .text(format!(
                "This message was created automatically by mail delivery software.\r\n\r\n\
                 A message that you sent could not be delivered to one or more of its \
                 recipients. This is a permanent error. The following address(es) failed:\r\n\r\n\
                 {recipients}\r\n{reason}\r\n\r\n\
                 ----- A copy of the original message is attached -----"
            ))
            .attach("message.txt", "text/plain", original),
    )
}
