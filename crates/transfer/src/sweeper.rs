use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::store::ChunkStore;

/// Retention policy for the background sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPolicy {
    /// Time between sweeps.
    pub interval: Duration,
    /// Completed tokens idle longer than this are dropped.
    pub completed_max_age: Duration,
    /// Incomplete transfers idle longer than this are discarded with their chunks.
    pub abandoned_max_age: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            completed_max_age: Duration::from_secs(3600),
            abandoned_max_age: Duration::from_secs(86400),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub completed_removed: usize,
    pub abandoned_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.completed_removed == 0 && self.abandoned_removed == 0
    }
}

/// Periodically applies a [`SweepPolicy`] to a [`ChunkStore`].
///
/// At most one sweep runs at a time; a tick that fires while the previous
/// sweep is still running is skipped.
pub struct Sweeper {
    store: Arc<ChunkStore>,
    policy: SweepPolicy,
    running: Mutex<()>,
}

impl Sweeper {
    pub fn new(store: Arc<ChunkStore>, policy: SweepPolicy) -> Self {
        Self {
            store,
            policy,
            running: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &SweepPolicy {
        &self.policy
    }

    /// Runs one sweep. Returns `Ok(None)` if another sweep is in progress.
    pub async fn sweep_once(&self) -> Result<Option<SweepReport>, TransferError> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("sweep already running, skipping");
            return Ok(None);
        };
        let report = self.store.sweep(&self.policy).await?;
        if !report.is_empty() {
            info!(
                completed = report.completed_removed,
                abandoned = report.abandoned_removed,
                "sweep finished"
            );
        }
        Ok(Some(report))
    }

    /// Sweeps on every interval tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.policy.interval.as_secs(), "sweeper started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let sweeper = Arc::clone(&self);
                    // A slow sweep must not hold up cancellation.
                    tokio::spawn(async move {
                        if let Err(e) = sweeper.sweep_once().await {
                            warn!(error = %e, "sweep failed");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::registry::ResumeRegistry;
    use dbshuttle_protocol::FileMetadata;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<ChunkStore> {
        let registry = Arc::new(ResumeRegistry::in_memory());
        Arc::new(ChunkStore::new(dir.path(), registry, 1024).unwrap())
    }

    fn zero_age_policy() -> SweepPolicy {
        SweepPolicy {
            interval: Duration::from_millis(10),
            completed_max_age: Duration::ZERO,
            abandoned_max_age: Duration::ZERO,
        }
    }

    async fn open_transfer(store: &ChunkStore) -> String {
        let meta = FileMetadata {
            file_name: "a.bin".into(),
            total_size: 8,
            chunk_size: 4,
            file_checksum: checksum_bytes(b"abcdefgh"),
        };
        store.initialize_transfer(meta).await.unwrap().transfer_id
    }

    #[test]
    fn default_policy() {
        let p = SweepPolicy::default();
        assert_eq!(p.interval, Duration::from_secs(300));
        assert_eq!(p.completed_max_age, Duration::from_secs(3600));
        assert_eq!(p.abandoned_max_age, Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn sweep_once_removes_abandoned() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = open_transfer(&store).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeper = Sweeper::new(Arc::clone(&store), zero_age_policy());
        let report = sweeper.sweep_once().await.unwrap().unwrap();
        assert_eq!(report.abandoned_removed, 1);
        assert!(!store.partial_dir(&id).exists());
    }

    #[tokio::test]
    async fn overlapping_sweep_is_skipped() {
        let dir = TempDir::new().unwrap();
        let sweeper = Sweeper::new(store(&dir), SweepPolicy::default());

        let _held = sweeper.running.lock().await;
        assert!(sweeper.sweep_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_sweeps_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        open_transfer(&store).await;

        let sweeper = Arc::new(Sweeper::new(Arc::clone(&store), zero_age_policy()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&sweeper).run(cancel.clone()));

        for _ in 0..100 {
            if store.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.registry().is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
