//! Error types for the data channel.

use std::time::Duration;

use dbshuttle_protocol::ErrorKind;
use dbshuttle_transfer::{TransferError, TransferState};

/// Errors produced by the TCP data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid frame header: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rejected by receiver ({kind}): {message}")]
    Rejected {
        kind: ErrorKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl DataChannelError {
    /// Classifies the error for retry decisions and for the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataChannelError::Io(_)
            | DataChannelError::Timeout
            | DataChannelError::Cancelled
            | DataChannelError::ConnectionClosed => ErrorKind::Transient,
            DataChannelError::Protocol(_) | DataChannelError::Json(_) => ErrorKind::Protocol,
            DataChannelError::Rejected { kind, .. } => *kind,
            DataChannelError::Transfer(e) => e.kind(),
        }
    }

    pub(crate) fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        DataChannelError::Rejected {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }
}

/// A transfer that stopped before the receiver confirmed finalization.
///
/// Carries what a caller needs to resume: the transfer ID, its resume token,
/// and the last chunk the receiver confirmed during this run.
#[derive(Debug, thiserror::Error)]
#[error("transfer {transfer_id} {state:?} (last confirmed chunk {last_confirmed_chunk:?}): {source}")]
pub struct TransferFailed {
    pub transfer_id: String,
    pub resume_token: String,
    pub last_confirmed_chunk: Option<u32>,
    /// `Interrupted` when cancelled or out of network retries, `Failed` otherwise.
    pub state: TransferState,
    #[source]
    pub source: DataChannelError,
}

impl TransferFailed {
    /// Whether `resume_transfer` with the same token can make progress, possibly
    /// after an operator clears a fatal condition on the receiver.
    pub fn is_resumable(&self) -> bool {
        self.state == TransferState::Interrupted || self.source.kind() == ErrorKind::Fatal
    }
}
