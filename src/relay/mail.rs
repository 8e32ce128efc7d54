//! The persisted form of one queued delivery.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::RelayError, headers::Headers, smtp::context::Envelope};

/// Extension of the message body; the meta record adds `.info`.
pub const MESSAGE_EXTENSION: &str = "msg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub date: DateTime<Utc>,
    pub error: String,
    pub permanent: bool,
}

/// One message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub id: String,
    /// The message body.
    pub file: PathBuf,
    /// This record.
    pub meta: PathBuf,
    pub envelope: Envelope,
    pub headers: Headers,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub failures: Vec<Failure>,
}

impl Mail {
    /// A fresh record in `dir` for `from` to the single recipient `to`.
    pub fn new(dir: &Path, from: &str, to: &str, headers: Headers) -> Self {
        let id = ulid::Ulid::new().to_string();
        let file = dir.join(format!("{id}.{MESSAGE_EXTENSION}"));
        let meta = dir.join(format!("{id}.{MESSAGE_EXTENSION}.info"));
        let now = Utc::now();

        Self {
            id,
            file,
            meta,
            envelope: Envelope {
                from: Some(from.to_string()),
                to: vec![to.to_string()],
            },
            headers,
            created: now,
            updated: now,
            failures: Vec::new(),
        }
    }

    pub fn sender(&self) -> &str {
        self.envelope.from.as_deref().unwrap_or("<>")
    }

    pub fn recipients(&self) -> &[String] {
        &self.envelope.to
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.failures.last()
    }

    /// # Errors
    ///
    /// If the file cannot be read or is not a valid record.
    pub async fn read(meta: &Path) -> Result<Self, RelayError> {
        let contents = tokio::fs::read(meta).await?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Replaces the record on disk. The new contents are written beside it
    /// and renamed into place, so a crash never leaves half a record.
    ///
    /// # Errors
    ///
    /// If the record cannot be written.
    pub async fn write(&self) -> Result<(), RelayError> {
        let json = serde_json::to_vec_pretty(self)?;
        let staging = self.meta.with_extension("info.tmp");

        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &self.meta).await?;
        Ok(())
    }
}

/// Whether `path` looks like a queue record.
pub fn is_meta(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "info")
        && path
            .file_stem()
            .and_then(|stem| Path::new(stem).extension())
            .is_some_and(|ext| ext == MESSAGE_EXTENSION)
}
