//! Data types for the backup flow.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dbshuttle_protocol::ErrorKind;
use dbshuttle_transfer::TransferProgress;
use serde::{Deserialize, Serialize};

/// Where to reach the MySQL instance once it is back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3306,
        }
    }
}

/// Archive and token left behind by an interrupted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub archive_path: PathBuf,
    pub resume_token: String,
}

/// One backup request.
#[derive(Debug, Clone)]
pub struct BackupJob {
    /// Service manager unit name, e.g. `mysql`.
    pub service_name: String,
    pub data_dir: PathBuf,
    pub connection: ConnectionInfo,
    /// Keep the archive after a confirmed transfer.
    pub keep_archive: bool,
    /// Continue an interrupted run instead of taking a new snapshot.
    pub resume: Option<ResumePoint>,
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Succeeded,
    /// Stopped in a way a later run can resume from.
    Interrupted,
    Failed,
}

/// Record persisted through [`OutcomeStore`](crate::OutcomeStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub service_name: String,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    /// Whether the archive is still on disk after the run.
    pub archive_kept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_checksum: Option<String>,
    pub total_bytes: u64,
    pub service_stopped: bool,
    pub service_restarted: bool,
    pub service_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BackupOutcome {
    pub(crate) fn begin(job: &BackupJob, started_at: DateTime<Utc>) -> Self {
        Self {
            service_name: job.service_name.clone(),
            status: BackupStatus::Failed,
            archive_path: job.resume.as_ref().map(|r| r.archive_path.clone()),
            archive_kept: job.resume.is_some(),
            transfer_id: None,
            resume_token: job.resume.as_ref().map(|r| r.resume_token.clone()),
            final_checksum: None,
            total_bytes: 0,
            service_stopped: false,
            service_restarted: false,
            service_available: false,
            error: None,
            error_kind: None,
            started_at,
            finished_at: started_at,
        }
    }

    /// The point a later run can continue from, if this one left one behind.
    pub fn resume_point(&self) -> Option<ResumePoint> {
        if self.status != BackupStatus::Interrupted || !self.archive_kept {
            return None;
        }
        Some(ResumePoint {
            archive_path: self.archive_path.clone()?,
            resume_token: self.resume_token.clone()?,
        })
    }
}

/// Pipeline stage, reported through [`BackupEvent::Stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    StoppingService,
    Compressing,
    Transferring,
    StartingService,
    Verifying,
    Recording,
}

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Stage(BackupStage),
    Progress(TransferProgress),
    Finished(BackupStatus),
}
