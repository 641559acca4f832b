//! Backup run orchestration.

use std::path::Path;

use chrono::Utc;
use dbshuttle_data_channel::{TransferClient, TransferConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::BackupError;
use crate::services::{Compressor, OutcomeStore, ServiceControl};
use crate::types::{BackupEvent, BackupJob, BackupOutcome, BackupStage, BackupStatus};

/// Runs backups with one set of collaborators.
pub struct BackupPipeline<S, C, O> {
    service: S,
    compressor: C,
    outcomes: O,
    transfer: TransferConfig,
    events: Option<mpsc::Sender<BackupEvent>>,
}

impl<S, C, O> BackupPipeline<S, C, O>
where
    S: ServiceControl,
    C: Compressor,
    O: OutcomeStore,
{
    pub fn new(service: S, compressor: C, outcomes: O, transfer: TransferConfig) -> Self {
        Self {
            service,
            compressor,
            outcomes,
            transfer,
            events: None,
        }
    }

    /// Sends stage and progress events to `tx`. Progress events are dropped
    /// while the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<BackupEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer
    }

    pub fn outcomes(&self) -> &O {
        &self.outcomes
    }

    /// Runs one backup and records its outcome.
    ///
    /// The service is started again whenever this run stopped it (or tried
    /// to), whatever happened in between. The archive is removed only after
    /// the receiver confirmed it, and only when `keep_archive` is off.
    pub async fn run(
        &self,
        job: &BackupJob,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome, BackupError> {
        let mut outcome = BackupOutcome::begin(job, Utc::now());
        info!(
            service = %job.service_name,
            data_dir = %job.data_dir.display(),
            resume = job.resume.is_some(),
            "backup started"
        );

        let mut result = match &job.resume {
            Some(point) => {
                self.transfer(&point.archive_path, Some(&point.resume_token), cancel, &mut outcome)
                    .await
            }
            None => self.snapshot_and_transfer(job, cancel, &mut outcome).await,
        };

        if job.resume.is_none() {
            if let Err(e) = self.restart(job, &mut outcome).await {
                error!(service = %job.service_name, "service not restored: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if outcome.final_checksum.is_some() && !job.keep_archive {
            if let Some(archive) = &outcome.archive_path {
                match tokio::fs::remove_file(archive).await {
                    Ok(()) => outcome.archive_kept = false,
                    Err(e) => warn!(archive = %archive.display(), "could not remove archive: {e}"),
                }
            }
        }

        outcome.status = match &result {
            Ok(()) => BackupStatus::Succeeded,
            Err(e) if e.is_resumable() && outcome.archive_kept && outcome.resume_token.is_some() => {
                BackupStatus::Interrupted
            }
            Err(_) => BackupStatus::Failed,
        };
        if let Err(e) = &result {
            outcome.error = Some(e.to_string());
            outcome.error_kind = Some(e.kind());
        }
        outcome.finished_at = Utc::now();

        self.emit(BackupEvent::Stage(BackupStage::Recording)).await;
        if let Err(e) = self.outcomes.record(&outcome).await {
            error!("could not record backup outcome: {e}");
        }
        self.emit(BackupEvent::Finished(outcome.status)).await;

        match result {
            Ok(()) => {
                info!(
                    service = %job.service_name,
                    transfer_id = ?outcome.transfer_id,
                    total_bytes = outcome.total_bytes,
                    "backup completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    service = %job.service_name,
                    status = ?outcome.status,
                    "backup did not complete: {e}"
                );
                Err(e)
            }
        }
    }

    async fn snapshot_and_transfer(
        &self,
        job: &BackupJob,
        cancel: &CancellationToken,
        outcome: &mut BackupOutcome,
    ) -> Result<(), BackupError> {
        check_cancelled(cancel)?;
        self.emit(BackupEvent::Stage(BackupStage::StoppingService)).await;
        if !self.service.stop(&job.service_name).await? {
            return Err(BackupError::Service(format!(
                "service {} did not stop",
                job.service_name
            )));
        }
        outcome.service_stopped = true;
        info!(service = %job.service_name, "service stopped");

        check_cancelled(cancel)?;
        self.emit(BackupEvent::Stage(BackupStage::Compressing)).await;
        let archive = self.compressor.compress_directory(&job.data_dir).await?;
        outcome.archive_path = Some(archive.clone());
        outcome.archive_kept = true;
        info!(archive = %archive.display(), "data directory compressed");

        self.transfer(&archive, None, cancel, outcome).await
    }

    async fn transfer(
        &self,
        archive: &Path,
        resume_token: Option<&str>,
        cancel: &CancellationToken,
        outcome: &mut BackupOutcome,
    ) -> Result<(), BackupError> {
        check_cancelled(cancel)?;
        self.emit(BackupEvent::Stage(BackupStage::Transferring)).await;

        let client = TransferClient::new(self.transfer.clone()).with_cancel(cancel.child_token());
        let handle = match resume_token {
            Some(token) => client.resume_transfer(archive, token).await?,
            None => client.start_transfer(archive).await?,
        };
        outcome.transfer_id = Some(handle.transfer_id().to_string());
        outcome.resume_token = Some(handle.resume_token().to_string());

        let mut progress = handle.subscribe();
        let wait = handle.wait();
        tokio::pin!(wait);
        let result = loop {
            tokio::select! {
                result = &mut wait => break result,
                changed = progress.changed() => {
                    if changed.is_err() {
                        break (&mut wait).await;
                    }
                    let snapshot = progress.borrow_and_update().clone();
                    self.emit_progress(BackupEvent::Progress(snapshot));
                }
            }
        };

        let done = result?;
        outcome.final_checksum = Some(done.final_checksum);
        outcome.total_bytes = done.total_bytes;
        Ok(())
    }

    async fn restart(&self, job: &BackupJob, outcome: &mut BackupOutcome) -> Result<(), BackupError> {
        self.emit(BackupEvent::Stage(BackupStage::StartingService)).await;
        if !self.service.start(&job.service_name).await? {
            return Err(BackupError::Service(format!(
                "service {} did not start",
                job.service_name
            )));
        }
        outcome.service_restarted = true;

        self.emit(BackupEvent::Stage(BackupStage::Verifying)).await;
        if !self.service.verify_availability(&job.connection).await? {
            return Err(BackupError::Service(format!(
                "service {} is not accepting connections on {}:{}",
                job.service_name, job.connection.host, job.connection.port
            )));
        }
        outcome.service_available = true;
        info!(service = %job.service_name, "service restored");
        Ok(())
    }

    async fn emit(&self, event: BackupEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    fn emit_progress(&self, event: BackupEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), BackupError> {
    if cancel.is_cancelled() {
        Err(BackupError::Cancelled)
    } else {
        Ok(())
    }
}
