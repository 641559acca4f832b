use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure category carried in rejections and error frames.
///
/// Duplicate deliveries are not a kind: they are acknowledged as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Network timeout, temporary disk pressure. Retry with backoff.
    Transient,
    /// Chunk or whole-file checksum mismatch. Re-send the chunk or restart.
    Integrity,
    /// Malformed message, unknown transfer, out-of-range index. Do not retry.
    Protocol,
    /// Storage allocation failure, disk full. Resumable once the condition clears.
    Fatal,
}

impl ErrorKind {
    /// Whether the client may retry the same operation on its own.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Integrity)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Identity and layout of a file being transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    /// SHA-256 hex digest of the whole file.
    pub file_checksum: String,
}

impl FileMetadata {
    /// Number of chunks as a `u64`, or `None` when `chunk_size` is zero.
    ///
    /// An empty file still has one (empty) chunk.
    pub fn chunk_count(&self) -> Option<u64> {
        if self.chunk_size == 0 {
            return None;
        }
        if self.total_size == 0 {
            return Some(1);
        }
        Some(self.total_size.div_ceil(self.chunk_size))
    }

    /// Number of chunks, saturating at `u32::MAX`. Zero when `chunk_size` is zero.
    pub fn total_chunks(&self) -> u32 {
        self.chunk_count()
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Byte offset of chunk `index` within the file.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        u64::from(index).saturating_mul(self.chunk_size)
    }

    /// Length in bytes of chunk `index` (0 for an out-of-range index).
    pub fn chunk_len(&self, index: u32) -> u64 {
        if index >= self.total_chunks() {
            return 0;
        }
        let offset = self.chunk_offset(index);
        std::cmp::min(self.chunk_size, self.total_size - offset)
    }

    /// Whether `index` is the last chunk of the file.
    pub fn is_last_chunk(&self, index: u32) -> bool {
        let total = self.total_chunks();
        total > 0 && index == total - 1
    }
}
