use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dbshuttle_protocol::FileMetadata;

/// One segment of a transfer's file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 0-based chunk index.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
    /// SHA-256 hex checksum of `data`.
    pub checksum: String,
    /// Whether this is the final chunk of the file.
    pub is_last: bool,
}

impl Chunk {
    /// Size of this chunk in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Fact of completion for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedChunk {
    pub size: u64,
    pub checksum: String,
}

/// Durable bookkeeping for one transfer's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeToken {
    pub token: String,
    pub transfer_id: String,
    pub file: FileMetadata,
    #[serde(default)]
    pub completed_chunks: BTreeMap<u32, CompletedChunk>,
    #[serde(default)]
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ResumeToken {
    /// Indices confirmed so far.
    pub fn completed_indices(&self) -> BTreeSet<u32> {
        self.completed_chunks.keys().copied().collect()
    }

    /// Total bytes across confirmed chunks.
    pub fn completed_bytes(&self) -> u64 {
        self.completed_chunks.values().map(|c| c.size).sum()
    }

    /// Number of chunks in the transfer.
    pub fn total_chunks(&self) -> u32 {
        self.file.total_chunks()
    }

    /// Indices in `[0, total_chunks)` not yet confirmed, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks())
            .filter(|i| !self.completed_chunks.contains_key(i))
            .collect()
    }

    /// Whether every chunk has been confirmed.
    pub fn is_fully_received(&self) -> bool {
        self.completed_chunks.len() as u64 == u64::from(self.total_chunks())
    }

    /// Time since the last recorded activity (zero if the clock went backwards).
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }
}

/// Returned when the receiver opens or resumes a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTicket {
    pub transfer_id: String,
    pub token: String,
    pub total_chunks: u32,
    pub completed: BTreeSet<u32>,
}

/// Receiver-side progress after a chunk is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub completed_bytes: u64,
    pub total_bytes: u64,
}

impl ChunkProgress {
    pub(crate) fn from_token(token: &ResumeToken) -> Self {
        Self {
            completed_chunks: token.completed_chunks.len() as u32,
            total_chunks: token.total_chunks(),
            completed_bytes: token.completed_bytes(),
            total_bytes: token.file.total_size,
        }
    }

    /// Whether every index is present and finalization may run.
    pub fn is_ready(&self) -> bool {
        self.total_chunks > 0 && self.completed_chunks == self.total_chunks
    }
}

/// A finalized, verified archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedFile {
    pub transfer_id: String,
    pub path: PathBuf,
    pub checksum: String,
}

/// Client-side transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Initialized,
    Sending,
    AwaitingFinalization,
    Completed,
    Failed,
    /// Cancelled or disconnected; may be resumed with the same token.
    Interrupted,
}

impl TransferState {
    /// Whether no further progress will be made under this handle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Interrupted
        )
    }
}

/// Client-side progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub state: TransferState,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub bytes_per_second: f64,
}

impl TransferProgress {
    /// Highest fraction reported before the receiver confirms finalization.
    pub const MAX_UNCONFIRMED_FRACTION: f64 = 0.999;

    /// Completed fraction in `[0, 1]`; exactly 1.0 only once completed.
    pub fn fraction(&self) -> f64 {
        if self.state == TransferState::Completed {
            return 1.0;
        }
        if self.total_bytes == 0 {
            return 0.0;
        }
        let ratio = self.completed_bytes as f64 / self.total_bytes as f64;
        ratio.min(Self::MAX_UNCONFIRMED_FRACTION)
    }
}
