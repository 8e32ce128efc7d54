use serde::{Deserialize, Serialize};

/// Message headers in the order they appear, names as written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Parses the header section at the start of `message`.
    ///
    /// # Errors
    ///
    /// If the header section is malformed.
    pub fn parse(message: &[u8]) -> Result<Self, mailparse::MailParseError> {
        let (headers, _) = mailparse::parse_headers(message)?;
        Ok(Self(
            headers
                .iter()
                .map(|header| (header.get_key(), header.get_value()))
                .collect(),
        ))
    }

    /// First value of the header `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub const fn len(&self) -> usize {
        self.0.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
