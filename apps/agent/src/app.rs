//! Agent commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use dbshuttle_backup::{
    BackupEvent, BackupJob, BackupPipeline, JsonLinesOutcomeStore, ResumePoint,
};
use dbshuttle_data_channel::TransferClient;
use dbshuttle_transfer::TransferState;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::system::{SystemctlService, TarCompressor};

/// Cancels `cancel` on the first SIGINT.
fn cancel_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, stopping after in-flight chunks");
            cancel.cancel();
        }
    });
}

/// Logs pipeline events: every stage, and progress at each 10% step.
async fn log_events(mut rx: mpsc::Receiver<BackupEvent>) {
    let mut last_decile = None;
    while let Some(event) = rx.recv().await {
        match event {
            BackupEvent::Stage(stage) => tracing::info!(?stage, "backup stage"),
            BackupEvent::Progress(p) => {
                let decile = (p.fraction() * 10.0).floor() as u32;
                if last_decile != Some(decile) {
                    last_decile = Some(decile);
                    tracing::info!(
                        transfer_id = %p.transfer_id,
                        percent = decile * 10,
                        completed_chunks = p.completed_chunks,
                        total_chunks = p.total_chunks,
                        bytes_per_second = p.bytes_per_second as u64,
                        "transfer progress"
                    );
                }
            }
            BackupEvent::Finished(status) => tracing::info!(?status, "backup finished"),
        }
    }
}

async fn run_pipeline(config: &Config, job: BackupJob) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let (tx, rx) = mpsc::channel(256);
    let logger = tokio::spawn(log_events(rx));
    let pipeline = BackupPipeline::new(
        SystemctlService::default(),
        TarCompressor::new(&config.archive_dir),
        JsonLinesOutcomeStore::new(&config.outcome_log),
        config.transfer_config(),
    )
    .with_events(tx);

    let result = pipeline.run(&job, &cancel).await;
    drop(pipeline);
    let _ = logger.await;

    match result {
        Ok(outcome) => {
            tracing::info!(
                transfer_id = ?outcome.transfer_id,
                checksum = ?outcome.final_checksum,
                "backup stored on receiver"
            );
            Ok(())
        }
        Err(e) if e.is_resumable() => Err(anyhow!(e).context("backup interrupted; run `resume` to continue")),
        Err(e) => Err(anyhow!(e).context("backup failed")),
    }
}

/// Stops MySQL, archives its data directory, ships it and restarts MySQL.
pub async fn backup(config: Config, keep_archive: bool) -> anyhow::Result<()> {
    let job = BackupJob {
        service_name: config.mysql_service.clone(),
        data_dir: config.data_dir.clone(),
        connection: config.connection(),
        keep_archive: keep_archive || config.keep_archive,
        resume: None,
    };
    run_pipeline(&config, job).await
}

/// Continues an interrupted backup. Without explicit arguments the last
/// interrupted run in the outcome log is used.
pub async fn resume(
    config: Config,
    archive: Option<PathBuf>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let point = match (archive, token) {
        (Some(archive_path), Some(resume_token)) => ResumePoint {
            archive_path,
            resume_token,
        },
        (None, None) => {
            let store = JsonLinesOutcomeStore::new(&config.outcome_log);
            store
                .latest()
                .await?
                .and_then(|o| o.resume_point())
                .ok_or_else(|| anyhow!("no interrupted backup in {}", config.outcome_log.display()))?
        }
        _ => return Err(anyhow!("--archive and --token must be given together")),
    };
    tracing::info!(archive = %point.archive_path.display(), "resuming backup");

    let job = BackupJob {
        service_name: config.mysql_service.clone(),
        data_dir: config.data_dir.clone(),
        connection: config.connection(),
        keep_archive: config.keep_archive,
        resume: Some(point),
    };
    run_pipeline(&config, job).await
}

/// Sends one file without touching MySQL.
pub async fn send(config: Config, file: &Path, token: Option<String>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let client = TransferClient::new(config.transfer_config()).with_cancel(cancel);
    let handle = match token {
        Some(t) => client.resume_transfer(file, &t).await,
        None => client.start_transfer(file).await,
    }
    .with_context(|| format!("could not open transfer for {}", file.display()))?;

    tracing::info!(
        transfer_id = handle.transfer_id(),
        resume_token = handle.resume_token(),
        "transfer started"
    );
    match handle.wait().await {
        Ok(done) => {
            tracing::info!(
                transfer_id = %done.transfer_id,
                chunks_sent = done.chunks_sent,
                checksum = %done.final_checksum,
                "file stored on receiver"
            );
            Ok(())
        }
        Err(e) if e.state == TransferState::Interrupted => Err(anyhow!(
            "transfer interrupted; resume with --token {}: {}",
            e.resume_token,
            e.source
        )),
        Err(e) => Err(e.into()),
    }
}

/// Prints which chunks the receiver holds for a transfer.
pub async fn status(config: Config, transfer_id: &str, token: &str) -> anyhow::Result<()> {
    let client = TransferClient::new(config.transfer_config());
    let status = client.query_status(transfer_id, token).await?;
    println!(
        "transfer {}: {}/{} chunks{}",
        status.transfer_id,
        status.completed_chunks.len(),
        status.total_chunks,
        if status.is_completed { ", completed" } else { "" }
    );
    Ok(())
}
