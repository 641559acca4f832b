use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use dbshuttle_protocol::FileMetadata;

use crate::TransferError;
use crate::checksum::checksum_bytes;
use crate::types::Chunk;

/// Reads chunk `index` of the file at `path` laid out per `layout`.
///
/// Used by concurrent senders, each of which opens its own handle. Fails if
/// the file is shorter than the layout says (it changed since it was hashed).
pub async fn read_chunk_at(
    path: &Path,
    layout: &FileMetadata,
    index: u32,
) -> Result<Chunk, TransferError> {
    let total = layout.total_chunks();
    if index >= total {
        return Err(TransferError::ChunkOutOfRange { index, total });
    }
    let offset = layout.chunk_offset(index);
    let len = layout.chunk_len(index) as usize;

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data).await?;

    let (data, checksum) = tokio::task::spawn_blocking(move || {
        let checksum = checksum_bytes(&data);
        (data, checksum)
    })
    .await
    .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;
    Ok(Chunk {
        index,
        offset,
        data,
        checksum,
        is_last: layout.is_last_chunk(index),
    })
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Writes verified chunks as individual files under a transfer's directory.
///
/// Each chunk lands in `chunk_<index>`; writes go through a temporary file and
/// a rename so a crash never leaves a half-written chunk under its final name,
/// and re-writing an index simply replaces it.
pub struct ChunkWriter {
    dir: PathBuf,
}

impl ChunkWriter {
    /// Creates a writer rooted at `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Path of the file holding chunk `index`.
    pub fn chunk_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("chunk_{index}"))
    }

    /// Whether chunk `index` is present on disk.
    pub fn has_chunk(&self, index: u32) -> bool {
        self.chunk_path(index).is_file()
    }

    /// Verifies and durably writes a chunk.
    pub fn write_chunk(&self, chunk: &Chunk) -> Result<(), TransferError> {
        if !crate::checksum::verify_bytes(&chunk.data, &chunk.checksum) {
            return Err(TransferError::ChecksumMismatch { index: chunk.index });
        }

        std::fs::create_dir_all(&self.dir)?;
        let final_path = self.chunk_path(chunk.index);
        let tmp_path = self.dir.join(format!("chunk_{}.tmp", chunk.index));

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&chunk.data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Returns the base directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
