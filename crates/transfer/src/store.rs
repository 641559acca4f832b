//! Receiver-side storage for in-flight and finalized transfers.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/<fileName>                            finalized archives
//! <root>/.partial/<transferId>/chunk_<index>   verified chunk payloads
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use dbshuttle_protocol::{ChunkMessage, FileMetadata};

use crate::TransferError;
use crate::checksum::transfer_id_for;
use crate::chunked::ChunkWriter;
use crate::reassembly::{audit_chunks_blocking, reassemble_blocking};
use crate::registry::{RegistryError, ResumeRegistry};
use crate::sweeper::{SweepPolicy, SweepReport};
use crate::token::validate_token;
use crate::types::{Chunk, ChunkProgress, FinalizedFile, ResumeToken, TransferTicket};
use crate::validation::{validate_checksum, validate_file_name};

/// Directory under the storage root holding in-progress transfers.
pub const PARTIAL_DIR: &str = ".partial";

/// Accepts chunks, tracks them in a [`ResumeRegistry`] and produces verified
/// archives.
///
/// Chunk writes for a transfer share a read lock; finalization and discard
/// take the write lock, so reassembly never observes a half-applied chunk and
/// two finalizations of the same transfer never overlap.
pub struct ChunkStore {
    root: PathBuf,
    registry: Arc<ResumeRegistry>,
    max_chunk_size: u64,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl ChunkStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    pub fn new(
        root: impl Into<PathBuf>,
        registry: Arc<ResumeRegistry>,
        max_chunk_size: u64,
    ) -> Result<Self, TransferError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(PARTIAL_DIR))?;
        Ok(Self {
            root,
            registry,
            max_chunk_size,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Arc<ResumeRegistry> {
        &self.registry
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    /// Directory holding the chunks of `transfer_id`.
    pub fn partial_dir(&self, transfer_id: &str) -> PathBuf {
        self.root.join(PARTIAL_DIR).join(transfer_id)
    }

    fn final_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    fn transfer_lock(&self, transfer_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(transfer_id.to_string()).or_default())
    }

    fn release_lock(&self, transfer_id: &str) {
        self.locks.lock().unwrap().remove(transfer_id);
    }

    fn record_for(&self, transfer_id: &str) -> Result<ResumeToken, TransferError> {
        match self.registry.get_by_transfer_id(transfer_id) {
            Ok(record) => Ok(record),
            Err(RegistryError::NotFound(_)) => {
                Err(TransferError::UnknownTransfer(transfer_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn validate_metadata(&self, meta: &FileMetadata) -> Result<(), TransferError> {
        validate_file_name(&meta.file_name)?;
        validate_checksum(&meta.file_checksum)?;
        if meta.chunk_size == 0 {
            return Err(TransferError::InvalidMetadata("chunk size must be > 0".into()));
        }
        if meta.chunk_size > self.max_chunk_size {
            return Err(TransferError::InvalidMetadata(format!(
                "chunk size {} exceeds limit {}",
                meta.chunk_size, self.max_chunk_size
            )));
        }
        match meta.chunk_count() {
            Some(n) if n <= u64::from(u32::MAX) => Ok(()),
            _ => Err(TransferError::InvalidMetadata(format!(
                "too many chunks for {} bytes at chunk size {}",
                meta.total_size, meta.chunk_size
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Transfer setup
    // -----------------------------------------------------------------------

    /// Opens a new transfer and allocates its resume token.
    pub async fn initialize_transfer(
        &self,
        meta: FileMetadata,
    ) -> Result<TransferTicket, TransferError> {
        self.validate_metadata(&meta)?;
        if tokio::fs::try_exists(self.final_path(&meta.file_name)).await? {
            return Err(TransferError::AlreadyExists(meta.file_name));
        }

        let transfer_id = transfer_id_for(&meta);
        let file_name = meta.file_name.clone();
        let total_size = meta.total_size;
        let token = self.registry.create(&transfer_id, meta)?;

        if let Err(e) = tokio::fs::create_dir_all(self.partial_dir(&transfer_id)).await {
            let _ = self.registry.remove(&token);
            return Err(e.into());
        }

        info!(
            transfer_id = %transfer_id,
            file = %file_name,
            total_size,
            "transfer initialized"
        );
        let record = self.registry.get_by_token(&token)?;
        Ok(ticket(&record))
    }

    /// Re-opens a transfer by token. The registry's completed set is returned
    /// as-is; the client only sends what is missing from it.
    pub async fn resume_transfer(
        &self,
        token: &str,
        meta: &FileMetadata,
    ) -> Result<TransferTicket, TransferError> {
        let record = self.registry.get_by_token(token)?;
        if !same_file(&record.file, meta) {
            return Err(TransferError::InvalidMetadata(format!(
                "metadata does not match transfer {}",
                record.transfer_id
            )));
        }
        if !record.is_completed {
            tokio::fs::create_dir_all(self.partial_dir(&record.transfer_id)).await?;
        }
        info!(
            transfer_id = %record.transfer_id,
            completed = record.completed_chunks.len(),
            total = record.total_chunks(),
            "transfer resumed"
        );
        Ok(ticket(&record))
    }

    /// Checks that `token` owns `transfer_id`, for worker connections.
    pub fn attach(&self, transfer_id: &str, token: &str) -> Result<ResumeToken, TransferError> {
        let record = self.record_for(transfer_id)?;
        if !validate_token(token, &record.token) {
            return Err(TransferError::InvalidToken(transfer_id.to_string()));
        }
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Verifies, stores and records one chunk.
    ///
    /// Re-sending an index that is already recorded overwrites the stored copy
    /// with identical bytes and succeeds. Chunks for a transfer that has already
    /// been finalized succeed without touching disk.
    pub async fn receive_chunk(
        &self,
        msg: &ChunkMessage,
        data: Vec<u8>,
    ) -> Result<ChunkProgress, TransferError> {
        let record = self.record_for(&msg.transfer_id)?;
        validate_chunk(&record.file, msg, data.len())?;

        let lock = self.transfer_lock(&msg.transfer_id);
        let _guard = lock.read().await;

        // The transfer may have been finalized or discarded while waiting.
        let record = self.record_for(&msg.transfer_id)?;
        if record.is_completed {
            debug!(
                transfer_id = %msg.transfer_id,
                chunk = msg.chunk_index,
                "chunk for completed transfer ignored"
            );
            return Ok(ChunkProgress::from_token(&record));
        }

        let chunk = Chunk {
            index: msg.chunk_index,
            offset: record.file.chunk_offset(msg.chunk_index),
            data,
            checksum: msg.chunk_checksum.to_ascii_lowercase(),
            is_last: msg.is_last_chunk,
        };
        let writer = ChunkWriter::new(&self.partial_dir(&msg.transfer_id));
        let registry = Arc::clone(&self.registry);
        let token = record.token.clone();

        let updated = tokio::task::spawn_blocking(move || -> Result<ResumeToken, TransferError> {
            writer.write_chunk(&chunk)?;
            Ok(registry.add_completed_chunk(&token, chunk.index, chunk.size(), &chunk.checksum)?)
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;

        let progress = ChunkProgress::from_token(&updated);
        debug!(
            transfer_id = %msg.transfer_id,
            chunk = msg.chunk_index,
            completed = progress.completed_chunks,
            total = progress.total_chunks,
            "chunk stored"
        );
        Ok(progress)
    }

    /// Current receiver-side progress for a transfer.
    pub fn progress(&self, transfer_id: &str) -> Result<ChunkProgress, TransferError> {
        Ok(ChunkProgress::from_token(&self.record_for(transfer_id)?))
    }

    /// Full registry record for a transfer.
    pub fn status(&self, transfer_id: &str) -> Result<ResumeToken, TransferError> {
        self.record_for(transfer_id)
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Reassembles and verifies a fully received transfer.
    ///
    /// Fails with [`TransferError::Incomplete`] while indices are missing.
    /// When reassembly fails, stored chunks that no longer match their
    /// recorded checksum are forgotten and reported as
    /// [`TransferError::CorruptChunks`]; the transfer stays open for them to be
    /// sent again. If every stored chunk is intact but the file digest still
    /// does not match, the transfer is discarded and
    /// [`TransferError::Integrity`] is returned, so a fresh start is accepted.
    /// Calling this again after success returns the same result.
    pub async fn finalize_transfer(&self, transfer_id: &str) -> Result<FinalizedFile, TransferError> {
        self.record_for(transfer_id)?;
        let lock = self.transfer_lock(transfer_id);
        let _guard = lock.write().await;

        let record = self.record_for(transfer_id)?;
        let final_path = self.final_path(&record.file.file_name);
        let finalized = FinalizedFile {
            transfer_id: transfer_id.to_string(),
            path: final_path.clone(),
            checksum: record.file.file_checksum.to_ascii_lowercase(),
        };
        if record.is_completed {
            return Ok(finalized);
        }

        let missing = record.missing_chunks();
        if !missing.is_empty() {
            return Err(TransferError::Incomplete { missing });
        }

        let partial = self.partial_dir(transfer_id);
        let file = record.file.clone();
        let target = final_path.clone();
        let placed = tokio::task::spawn_blocking(move || -> Result<(), TransferError> {
            let assembled = reassemble_blocking(&partial, &file)?;
            if target.exists() {
                let _ = std::fs::remove_file(&assembled);
                return Err(TransferError::AlreadyExists(file.file_name));
            }
            std::fs::rename(&assembled, &target)?;
            Ok(())
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;
        if let Err(e) = placed {
            return Err(self.recover_from_bad_chunks(&record, e).await);
        }

        self.registry.mark_completed(&record.token)?;

        let partial = self.partial_dir(transfer_id);
        if let Err(e) = tokio::fs::remove_dir_all(&partial).await {
            warn!(path = %partial.display(), error = %e, "failed to remove partial directory");
        }
        self.release_lock(transfer_id);

        info!(
            transfer_id = %transfer_id,
            path = %final_path.display(),
            size = record.file.total_size,
            "transfer finalized"
        );
        Ok(finalized)
    }

    /// Maps a failed reassembly onto the recovery the client can act on.
    /// Caller holds the transfer's write lock.
    async fn recover_from_bad_chunks(
        &self,
        record: &ResumeToken,
        cause: TransferError,
    ) -> TransferError {
        let recoverable = match &cause {
            TransferError::Integrity { .. } | TransferError::InvalidChunk(_) => true,
            TransferError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        };
        if !recoverable {
            return cause;
        }

        let partial = self.partial_dir(&record.transfer_id);
        let audited = record.clone();
        let bad = match tokio::task::spawn_blocking(move || audit_chunks_blocking(&partial, &audited))
            .await
        {
            Ok(Ok(bad)) => bad,
            Ok(Err(e)) => return e,
            Err(e) => return TransferError::Io(std::io::Error::other(e)),
        };

        if bad.is_empty() {
            if matches!(cause, TransferError::Integrity { .. }) {
                warn!(
                    transfer_id = %record.transfer_id,
                    file = %record.file.file_name,
                    "stored chunks are intact but the file digest differs, discarding transfer"
                );
                if let Err(e) = self.discard_unlocked(&record.transfer_id).await {
                    warn!(transfer_id = %record.transfer_id, error = %e, "discard failed");
                }
            }
            return cause;
        }

        let chunks = ChunkWriter::new(&self.partial_dir(&record.transfer_id));
        for &index in &bad {
            let _ = tokio::fs::remove_file(chunks.chunk_path(index)).await;
        }
        if let Err(e) = self.registry.drop_completed_chunks(&record.token, &bad) {
            return e.into();
        }
        warn!(
            transfer_id = %record.transfer_id,
            chunks = ?bad,
            "stored chunks failed verification, awaiting resend"
        );
        TransferError::CorruptChunks { indices: bad }
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Drops a transfer's token and partial data. Returns `false` if the
    /// transfer was unknown.
    pub async fn discard_transfer(&self, transfer_id: &str) -> Result<bool, TransferError> {
        let lock = self.transfer_lock(transfer_id);
        let _guard = lock.write().await;
        self.discard_unlocked(transfer_id).await
    }

    async fn discard_unlocked(&self, transfer_id: &str) -> Result<bool, TransferError> {
        let existed = match self.registry.get_by_transfer_id(transfer_id) {
            Ok(record) => self.registry.remove(&record.token)?.is_some(),
            Err(RegistryError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        let partial = self.partial_dir(transfer_id);
        match tokio::fs::remove_dir_all(&partial).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.release_lock(transfer_id);

        if existed {
            info!(transfer_id = %transfer_id, "transfer discarded");
        }
        Ok(existed)
    }

    /// Applies the retention policy once.
    pub async fn sweep(&self, policy: &SweepPolicy) -> Result<SweepReport, TransferError> {
        self.sweep_at(policy, Utc::now()).await
    }

    /// [`sweep`](Self::sweep) against an explicit clock.
    pub async fn sweep_at(
        &self,
        policy: &SweepPolicy,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, TransferError> {
        let completed_removed = self
            .registry
            .cleanup_completed_at(policy.completed_max_age, now)?;

        let mut abandoned_removed = 0;
        for record in self.registry.list_expired_at(policy.abandoned_max_age, now) {
            if record.is_completed {
                continue;
            }
            warn!(
                transfer_id = %record.transfer_id,
                file = %record.file.file_name,
                completed = record.completed_chunks.len(),
                total = record.total_chunks(),
                "discarding abandoned transfer"
            );
            if self.discard_transfer(&record.transfer_id).await? {
                abandoned_removed += 1;
            }
        }

        Ok(SweepReport {
            completed_removed,
            abandoned_removed,
        })
    }
}

fn ticket(record: &ResumeToken) -> TransferTicket {
    TransferTicket {
        transfer_id: record.transfer_id.clone(),
        token: record.token.clone(),
        total_chunks: record.total_chunks(),
        completed: record.completed_indices(),
    }
}

fn same_file(a: &FileMetadata, b: &FileMetadata) -> bool {
    a.file_name == b.file_name
        && a.total_size == b.total_size
        && a.chunk_size == b.chunk_size
        && a.file_checksum.eq_ignore_ascii_case(&b.file_checksum)
}

/// Checks a chunk header against the transfer's layout.
fn validate_chunk(file: &FileMetadata, msg: &ChunkMessage, len: usize) -> Result<(), TransferError> {
    let total = file.total_chunks();
    let index = msg.chunk_index;
    if index >= total {
        return Err(TransferError::ChunkOutOfRange { index, total });
    }
    if len as u64 != msg.chunk_size {
        return Err(TransferError::InvalidChunk(format!(
            "chunk {index}: header says {} bytes, payload is {len}",
            msg.chunk_size
        )));
    }
    let expected = file.chunk_len(index);
    if msg.chunk_size != expected {
        return Err(TransferError::InvalidChunk(format!(
            "chunk {index}: {} bytes, layout expects {expected}",
            msg.chunk_size
        )));
    }
    if msg.is_last_chunk != file.is_last_chunk(index) {
        return Err(TransferError::InvalidChunk(format!(
            "chunk {index}: last-chunk flag is {}",
            msg.is_last_chunk
        )));
    }
    Ok(())
}
