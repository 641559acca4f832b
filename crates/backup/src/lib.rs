//! Backup pipeline: stop MySQL, compress, transfer, restart, record.
//!
//! This crate holds the **orchestration** of one backup run. MySQL lifecycle
//! control, compression and outcome persistence are collaborators behind
//! traits ([`ServiceControl`], [`Compressor`], [`OutcomeStore`]); the agent
//! binary supplies process-backed implementations and tests use mocks.
//!
//! # Pipeline
//!
//! 1. **Stop** the MySQL service
//! 2. **Compress** its data directory into one archive
//! 3. **Transfer** the archive with resume support
//! 4. **Start** the service again, whatever the transfer outcome
//! 5. **Verify** the instance accepts connections
//! 6. **Record** the outcome
//!
//! A resumed run skips steps 1, 2, 4 and 5: it re-sends the archive kept by
//! the interrupted run.

pub mod error;
pub mod outcome;
pub mod pipeline;
pub mod services;
pub mod types;

pub use error::BackupError;
pub use outcome::JsonLinesOutcomeStore;
pub use pipeline::BackupPipeline;
pub use services::{BoxFuture, Compressor, OutcomeStore, ServiceControl};
pub use types::{
    BackupEvent, BackupJob, BackupOutcome, BackupStage, BackupStatus, ConnectionInfo, ResumePoint,
};
