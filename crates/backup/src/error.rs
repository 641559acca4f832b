//! Backup error types.

use dbshuttle_data_channel::{DataChannelError, TransferFailed};
use dbshuttle_protocol::ErrorKind;

/// Errors produced during a backup run.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service error: {0}")]
    Service(String),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("could not open transfer: {0}")]
    Channel(#[from] DataChannelError),

    #[error(transparent)]
    Transfer(#[from] TransferFailed),

    #[error("cancelled")]
    Cancelled,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Io(_) | BackupError::Cancelled => ErrorKind::Transient,
            BackupError::Json(_) => ErrorKind::Protocol,
            BackupError::Service(_) | BackupError::Compression(_) => ErrorKind::Fatal,
            BackupError::Channel(e) => e.kind(),
            BackupError::Transfer(e) => e.source.kind(),
        }
    }

    /// Whether a later run can continue from the kept archive.
    pub fn is_resumable(&self) -> bool {
        match self {
            BackupError::Transfer(e) => e.is_resumable(),
            BackupError::Channel(e) => e.kind() == ErrorKind::Transient,
            BackupError::Cancelled => true,
            _ => false,
        }
    }
}
