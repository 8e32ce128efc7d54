//! Outbound SMTP: the client used by the relay and by
//! [`Server::send_mail`](crate::Server::send_mail), and the message builder
//! for the latter.

mod error;
mod message;
mod response;
mod smtp_client;
mod transaction;

pub use error::{ClientError, Result};
pub use message::{Attachment, MessageBuilder};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, Timeouts};
pub use transaction::Transaction;
