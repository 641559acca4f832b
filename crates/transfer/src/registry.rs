//! Durable resume-token registry.
//!
//! Records, per transfer, which chunks the receiver has durably accepted.
//! Records live in memory and, when a path is configured, are snapshotted to a
//! JSON file after every mutation.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dbshuttle_protocol::{ErrorKind, FileMetadata};

use crate::token::generate_token;
use crate::types::{CompletedChunk, ResumeToken};

const SNAPSHOT_VERSION: u32 = 1;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("an active transfer already exists for {0}")]
    DuplicateTransfer(String),

    #[error("resume token not found: {0}")]
    NotFound(String),

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("cannot complete {transfer_id}: {missing} chunk(s) missing")]
    Incomplete { transfer_id: String, missing: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::DuplicateTransfer(_)
            | RegistryError::NotFound(_)
            | RegistryError::ChunkOutOfRange { .. }
            | RegistryError::Incomplete { .. } => ErrorKind::Protocol,
            RegistryError::Io(e) => crate::io_error_kind(e),
            RegistryError::Json(_) => ErrorKind::Fatal,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    tokens: Vec<ResumeToken>,
}

#[derive(Default)]
struct Inner {
    by_token: HashMap<String, ResumeToken>,
    /// transfer_id -> token
    by_transfer: HashMap<String, String>,
    /// Bumped on every mutation; orders snapshots.
    generation: u64,
}

impl Inner {
    fn insert(&mut self, record: ResumeToken) {
        self.by_transfer
            .insert(record.transfer_id.clone(), record.token.clone());
        self.by_token.insert(record.token.clone(), record);
    }

    fn remove(&mut self, token: &str) -> Option<ResumeToken> {
        let record = self.by_token.remove(token)?;
        if self.by_transfer.get(&record.transfer_id).map(String::as_str) == Some(token) {
            self.by_transfer.remove(&record.transfer_id);
        }
        Some(record)
    }

    fn snapshot(&self) -> Result<(u64, Vec<u8>), serde_json::Error> {
        let mut tokens: Vec<ResumeToken> = self.by_token.values().cloned().collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let json = serde_json::to_vec_pretty(&Snapshot {
            version: SNAPSHOT_VERSION,
            tokens,
        })?;
        Ok((self.generation, json))
    }
}

/// Registry of resume tokens, shared by every transfer in the process.
///
/// All operations are atomic per call. Adding a chunk that is already recorded
/// and completing a token twice are both no-ops, so duplicate deliveries and
/// retries never corrupt the record.
pub struct ResumeRegistry {
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
    /// Generation of the last snapshot written to disk.
    persisted: Mutex<u64>,
}

impl ResumeRegistry {
    /// Creates a registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: RwLock::new(Inner::default()),
            persisted: Mutex::new(0),
        }
    }

    /// Opens a registry backed by `path`, loading existing records.
    pub fn open(path: PathBuf) -> Result<Self, RegistryError> {
        let mut inner = Inner::default();
        for record in load_snapshot(&path)? {
            inner.insert(record);
        }
        info!(
            path = %path.display(),
            tokens = inner.by_token.len(),
            "resume registry opened"
        );
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(inner),
            persisted: Mutex::new(0),
        })
    }

    /// Allocates a token for a new transfer.
    ///
    /// Fails if a non-completed token already exists for `transfer_id`. A
    /// completed record for the same transfer is replaced.
    pub fn create(&self, transfer_id: &str, file: FileMetadata) -> Result<String, RegistryError> {
        let now = Utc::now();
        let token = generate_token();
        let snapshot = {
            let mut inner = self.inner.write().unwrap();
            if let Some(existing) = inner.by_transfer.get(transfer_id).cloned() {
                let active = inner
                    .by_token
                    .get(&existing)
                    .is_some_and(|r| !r.is_completed);
                if active {
                    return Err(RegistryError::DuplicateTransfer(transfer_id.to_string()));
                }
                inner.remove(&existing);
            }
            inner.insert(ResumeToken {
                token: token.clone(),
                transfer_id: transfer_id.to_string(),
                file,
                completed_chunks: Default::default(),
                is_completed: false,
                created_at: now,
                last_activity: now,
            });
            inner.generation += 1;
            inner.snapshot()?
        };
        self.persist(snapshot)?;
        debug!(transfer_id, "resume token created");
        Ok(token)
    }

    /// Looks up a record by token.
    pub fn get_by_token(&self, token: &str) -> Result<ResumeToken, RegistryError> {
        let inner = self.inner.read().unwrap();
        inner
            .by_token
            .get(token)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))
    }

    /// Looks up a record by transfer ID.
    pub fn get_by_transfer_id(&self, transfer_id: &str) -> Result<ResumeToken, RegistryError> {
        let inner = self.inner.read().unwrap();
        inner
            .by_transfer
            .get(transfer_id)
            .and_then(|t| inner.by_token.get(t))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(transfer_id.to_string()))
    }

    /// Records that chunk `index` was durably accepted. Returns the updated record.
    ///
    /// Re-recording an index refreshes its size/checksum and activity time.
    pub fn add_completed_chunk(
        &self,
        token: &str,
        index: u32,
        size: u64,
        checksum: &str,
    ) -> Result<ResumeToken, RegistryError> {
        let (record, snapshot) = {
            let mut inner = self.inner.write().unwrap();
            let record = inner
                .by_token
                .get_mut(token)
                .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;
            let total = record.total_chunks();
            if index >= total {
                return Err(RegistryError::ChunkOutOfRange { index, total });
            }
            record.completed_chunks.insert(
                index,
                CompletedChunk {
                    size,
                    checksum: checksum.to_string(),
                },
            );
            record.last_activity = Utc::now();
            let record = record.clone();
            inner.generation += 1;
            (record, inner.snapshot()?)
        };
        self.persist(snapshot)?;
        Ok(record)
    }

    /// Forgets chunks whose stored copy turned out to be missing or corrupt,
    /// so the client sends them again. Indices that are not recorded are
    /// ignored. A completed record is left untouched.
    pub fn drop_completed_chunks(
        &self,
        token: &str,
        indices: &[u32],
    ) -> Result<ResumeToken, RegistryError> {
        let (record, snapshot) = {
            let mut inner = self.inner.write().unwrap();
            let record = inner
                .by_token
                .get_mut(token)
                .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;
            if record.is_completed {
                return Ok(record.clone());
            }
            let before = record.completed_chunks.len();
            for index in indices {
                record.completed_chunks.remove(index);
            }
            if record.completed_chunks.len() == before {
                return Ok(record.clone());
            }
            record.last_activity = Utc::now();
            let record = record.clone();
            inner.generation += 1;
            (record, inner.snapshot()?)
        };
        self.persist(snapshot)?;
        Ok(record)
    }

    /// Returns the indices confirmed so far.
    pub fn get_completed_chunk_indices(&self, token: &str) -> Result<BTreeSet<u32>, RegistryError> {
        Ok(self.get_by_token(token)?.completed_indices())
    }

    /// Marks a transfer completed. Idempotent.
    pub fn mark_completed(&self, token: &str) -> Result<(), RegistryError> {
        let snapshot = {
            let mut inner = self.inner.write().unwrap();
            let record = inner
                .by_token
                .get_mut(token)
                .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;
            if record.is_completed {
                return Ok(());
            }
            let missing = record.missing_chunks().len();
            if missing > 0 {
                return Err(RegistryError::Incomplete {
                    transfer_id: record.transfer_id.clone(),
                    missing,
                });
            }
            record.is_completed = true;
            record.last_activity = Utc::now();
            inner.generation += 1;
            inner.snapshot()?
        };
        self.persist(snapshot)
    }

    /// Removes a record. Returns `None` if the token is unknown.
    pub fn remove(&self, token: &str) -> Result<Option<ResumeToken>, RegistryError> {
        let (removed, snapshot) = {
            let mut inner = self.inner.write().unwrap();
            let removed = inner.remove(token);
            if removed.is_none() {
                return Ok(None);
            }
            inner.generation += 1;
            (removed, inner.snapshot()?)
        };
        self.persist(snapshot)?;
        Ok(removed)
    }

    /// Records idle for longer than `max_age`, completed or not.
    pub fn list_expired(&self, max_age: Duration) -> Vec<ResumeToken> {
        self.list_expired_at(max_age, Utc::now())
    }

    /// [`list_expired`](Self::list_expired) against an explicit clock.
    pub fn list_expired_at(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<ResumeToken> {
        let inner = self.inner.read().unwrap();
        inner
            .by_token
            .values()
            .filter(|r| r.idle_for(now) > max_age)
            .cloned()
            .collect()
    }

    /// Removes records that are completed AND idle for longer than `max_age`.
    pub fn cleanup_completed(&self, max_age: Duration) -> Result<usize, RegistryError> {
        self.cleanup_completed_at(max_age, Utc::now())
    }

    /// [`cleanup_completed`](Self::cleanup_completed) against an explicit clock.
    pub fn cleanup_completed_at(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, RegistryError> {
        let (count, snapshot) = {
            let mut inner = self.inner.write().unwrap();
            let stale: Vec<String> = inner
                .by_token
                .values()
                .filter(|r| r.is_completed && r.idle_for(now) > max_age)
                .map(|r| r.token.clone())
                .collect();
            if stale.is_empty() {
                return Ok(0);
            }
            for token in &stale {
                inner.remove(token);
            }
            inner.generation += 1;
            (stale.len(), inner.snapshot()?)
        };
        self.persist(snapshot)?;
        debug!(count, "completed resume tokens cleaned up");
        Ok(count)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_token.len()
    }

    /// Whether the registry holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records not yet completed.
    pub fn active_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.by_token.values().filter(|r| !r.is_completed).count()
    }

    /// Writes a snapshot unless a newer one has already been written.
    fn persist(&self, (generation, json): (u64, Vec<u8>)) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut persisted = self.persisted.lock().unwrap();
        if generation <= *persisted {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        *persisted = generation;
        Ok(())
    }
}

/// Loads records from a snapshot file. A missing file is an empty registry.
fn load_snapshot(path: &Path) -> Result<Vec<ResumeToken>, RegistryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&data)?;
    if snapshot.version != SNAPSHOT_VERSION {
        warn!(
            path = %path.display(),
            version = snapshot.version,
            "unexpected registry snapshot version, loading anyway"
        );
    }
    Ok(snapshot.tokens)
}
