//! JSON-lines outcome log.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::BackupError;
use crate::services::{BoxFuture, OutcomeStore};
use crate::types::BackupOutcome;

/// Appends one JSON object per outcome to a file.
pub struct JsonLinesOutcomeStore {
    path: PathBuf,
}

impl JsonLinesOutcomeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every recorded outcome, oldest first. A missing file is empty.
    pub async fn load_all(&self) -> Result<Vec<BackupOutcome>, BackupError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut outcomes = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            outcomes.push(serde_json::from_str(line)?);
        }
        Ok(outcomes)
    }

    /// Most recent outcome, if any.
    pub async fn latest(&self) -> Result<Option<BackupOutcome>, BackupError> {
        Ok(self.load_all().await?.pop())
    }
}

impl OutcomeStore for JsonLinesOutcomeStore {
    fn record<'a>(&'a self, outcome: &'a BackupOutcome) -> BoxFuture<'a, Result<(), BackupError>> {
        Box::pin(async move {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut line = serde_json::to_vec(outcome)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
            tracing::debug!(path = %self.path.display(), status = ?outcome.status, "outcome recorded");
            Ok(())
        })
    }
}
