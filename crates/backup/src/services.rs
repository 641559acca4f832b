//! Collaborator traits.
//!
//! The pipeline only sees these traits, which keeps it testable with mocks.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::error::BackupError;
use crate::types::{BackupOutcome, ConnectionInfo};

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// MySQL instance lifecycle.
pub trait ServiceControl: Send + Sync {
    /// Stops the service. `Ok(false)` means the service manager refused.
    fn stop<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<bool, BackupError>>;

    /// Starts the service. `Ok(false)` means the service manager refused.
    fn start<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<bool, BackupError>>;

    /// Checks the instance accepts connections.
    fn verify_availability<'a>(
        &'a self,
        connection: &'a ConnectionInfo,
    ) -> BoxFuture<'a, Result<bool, BackupError>>;
}

/// Packs a directory into a single archive file.
pub trait Compressor: Send + Sync {
    /// Returns the path of the archive it produced.
    fn compress_directory<'a>(
        &'a self,
        source: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, BackupError>>;
}

/// Persists backup outcomes.
pub trait OutcomeStore: Send + Sync {
    fn record<'a>(&'a self, outcome: &'a BackupOutcome) -> BoxFuture<'a, Result<(), BackupError>>;
}
