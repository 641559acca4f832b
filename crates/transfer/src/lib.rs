//! Chunked backup transfer with resume support.
//!
//! Client and receiver share the chunk layout ([`read_chunk_at`], [`ChunkWriter`])
//! and checksum helpers. The receiver side owns a [`ChunkStore`] backed by a
//! [`ResumeRegistry`], which records every confirmed chunk so an interrupted
//! transfer can continue where it stopped.

mod checksum;
mod chunked;
mod progress;
mod reassembly;
mod registry;
mod store;
mod sweeper;
mod token;
mod types;
mod validation;

pub use checksum::{
    calculate_file_checksum, calculate_file_checksum_async, checksum_bytes, checksum_reader,
    transfer_id_for, verify_bytes,
};
pub use chunked::{ChunkWriter, read_chunk_at};
pub use progress::{ProgressTracker, SpeedCalculator};
pub use reassembly::{ASSEMBLED_FILE_NAME, audit_chunks_blocking, reassemble_blocking};
pub use registry::{RegistryError, ResumeRegistry};
pub use store::{ChunkStore, PARTIAL_DIR};
pub use sweeper::{SweepPolicy, SweepReport, Sweeper};
pub use token::{generate_token, validate_token};
pub use types::{
    Chunk, ChunkProgress, CompletedChunk, FinalizedFile, ResumeToken, TransferProgress,
    TransferState, TransferTicket,
};
pub use validation::{validate_checksum, validate_file_name};

use dbshuttle_protocol::ErrorKind;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    #[error("file integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("stored chunk(s) {indices:?} failed verification and must be sent again")]
    CorruptChunks { indices: Vec<u32> },

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("resume token does not match transfer {0}")]
    InvalidToken(String),

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("transfer incomplete: {} chunk(s) missing", missing.len())]
    Incomplete { missing: Vec<u32> },

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl TransferError {
    /// Classifies the error for the wire and for client retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Io(e) => io_error_kind(e),
            TransferError::ChecksumMismatch { .. }
            | TransferError::Integrity { .. }
            | TransferError::CorruptChunks { .. } => ErrorKind::Integrity,
            TransferError::UnknownTransfer(_)
            | TransferError::InvalidToken(_)
            | TransferError::ChunkOutOfRange { .. }
            | TransferError::InvalidChunk(_)
            | TransferError::InvalidMetadata(_)
            | TransferError::InvalidPath(_)
            | TransferError::Incomplete { .. }
            | TransferError::AlreadyExists(_) => ErrorKind::Protocol,
            TransferError::Registry(e) => e.kind(),
        }
    }
}

/// Disk-full and permission failures need an operator; everything else is
/// worth another attempt.
pub(crate) fn io_error_kind(e: &std::io::Error) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::StorageFull
        | std::io::ErrorKind::PermissionDenied
        | std::io::ErrorKind::ReadOnlyFilesystem => ErrorKind::Fatal,
        _ => ErrorKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(
            TransferError::ChecksumMismatch { index: 1 }.kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            TransferError::UnknownTransfer("t".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            TransferError::Incomplete { missing: vec![1] }.kind(),
            ErrorKind::Protocol
        );
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(TransferError::Io(timeout).kind(), ErrorKind::Transient);
        let full = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        assert_eq!(TransferError::Io(full).kind(), ErrorKind::Fatal);
        assert_eq!(
            TransferError::CorruptChunks { indices: vec![0] }.kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn incomplete_message_counts_missing() {
        let err = TransferError::Incomplete {
            missing: vec![1, 4],
        };
        assert_eq!(err.to_string(), "transfer incomplete: 2 chunk(s) missing");
    }
}
