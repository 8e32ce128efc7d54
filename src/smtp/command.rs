use core::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Events that only the server itself may emit. A client sending one of
/// these is treated as sending an unknown command.
pub const RESERVED: [&str; 5] = ["connect", "queue", "timeout", "relay", "unrecognized"];

/// Commands whose acceptance belongs to the current mail transaction.
pub const TRANSACTION: [&str; 4] = ["mail", "rcpt", "data", "queue"];

#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Text(String),
    /// Spooled message handed to the `queue` chain.
    File(PathBuf),
    /// What the client actually sent, when it was rerouted to `unrecognized`.
    Unrecognized { name: String, data: Option<String> },
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Command {
    /// Lowercased verb, which doubles as the event name.
    pub name: String,
    pub data: Payload,
}

impl Command {
    pub fn new(name: impl Into<String>, data: Payload) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            data,
        }
    }

    /// Wraps `self` as the payload of an `unrecognized` event.
    #[must_use]
    pub fn unrecognized(self) -> Self {
        let data = match self.data {
            Payload::Text(text) => Some(text),
            Payload::File(path) => Some(path.display().to_string()),
            Payload::None | Payload::Unrecognized { .. } => None,
        };

        Self {
            name: String::from("unrecognized"),
            data: Payload::Unrecognized {
                name: self.name,
                data,
            },
        }
    }

    /// The argument text, if any was given.
    pub fn text(&self) -> Option<&str> {
        match &self.data {
            Payload::Text(text) => Some(text.as_str()),
            Payload::Unrecognized { data, .. } => data.as_deref(),
            Payload::None | Payload::File(_) => None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED.contains(&self.name.as_str())
    }
}

impl From<&str> for Command {
    /// Splits a protocol line at the first space. The remainder, trimmed of
    /// trailing whitespace, becomes the argument text.
    fn from(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (name, data) = line.split_once(' ').unwrap_or((line, ""));
        let data = data.trim_end();

        Self::new(
            name,
            if data.is_empty() {
                Payload::None
            } else {
                Payload::Text(data.to_string())
            },
        )
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match &self.data {
            Payload::None => write!(fmt, "{}", self.name.to_ascii_uppercase()),
            Payload::Text(text) => write!(fmt, "{} {text}", self.name.to_ascii_uppercase()),
            Payload::File(path) => write!(fmt, "{} {}", self.name, path.display()),
            Payload::Unrecognized { name, data } => match data {
                Some(data) => write!(fmt, "{name} {data}"),
                None => write!(fmt, "{name}"),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_verb_and_argument() {
        let command = Command::from("MAIL FROM: <test@example.com>\r\n");
        assert_eq!(command.name, "mail");
        assert_eq!(command.text(), Some("FROM: <test@example.com>"));

        let command = Command::from("quit");
        assert_eq!(command.name, "quit");
        assert_eq!(command.data, Payload::None);
        assert_eq!(command.to_string(), "QUIT");

        let command = Command::from("EhLo   ");
        assert_eq!(command.name, "ehlo");
        assert_eq!(command.text(), None);
    }

    #[test]
    fn wraps_unrecognized_commands() {
        let command = Command::from("Queue /tmp/file").unrecognized();
        assert_eq!(command.name, "unrecognized");
        assert_eq!(
            command.data,
            Payload::Unrecognized {
                name: String::from("queue"),
                data: Some(String::from("/tmp/file")),
            }
        );
        assert_eq!(command.text(), Some("/tmp/file"));
        assert!(command.is_reserved());
        assert_eq!(command.to_string(), "queue /tmp/file");
    }
}
