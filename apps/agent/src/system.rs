//! Process-backed collaborators: `systemctl` and `tar`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use dbshuttle_backup::{BackupError, BoxFuture, Compressor, ConnectionInfo, ServiceControl};
use tokio::net::TcpStream;
use tokio::process::Command;

/// Controls the MySQL unit through `systemctl`.
pub struct SystemctlService {
    /// Connection attempts while waiting for the instance to come up.
    pub probe_attempts: u32,
    pub probe_interval: Duration,
}

impl Default for SystemctlService {
    fn default() -> Self {
        Self {
            probe_attempts: 30,
            probe_interval: Duration::from_secs(1),
        }
    }
}

impl SystemctlService {
    async fn systemctl(action: &str, service: &str) -> Result<bool, BackupError> {
        let output = Command::new("systemctl")
            .args([action, service])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackupError::Service(format!("failed to run systemctl {action}: {e}")))?;

        if !output.status.success() {
            tracing::warn!(
                service,
                action,
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "systemctl returned non-zero"
            );
        }
        Ok(output.status.success())
    }
}

impl ServiceControl for SystemctlService {
    fn stop<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<bool, BackupError>> {
        Box::pin(Self::systemctl("stop", service))
    }

    fn start<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<bool, BackupError>> {
        Box::pin(Self::systemctl("start", service))
    }

    fn verify_availability<'a>(
        &'a self,
        connection: &'a ConnectionInfo,
    ) -> BoxFuture<'a, Result<bool, BackupError>> {
        Box::pin(async move {
            let addr = format!("{}:{}", connection.host, connection.port);
            for attempt in 1..=self.probe_attempts.max(1) {
                let probe = tokio::time::timeout(self.probe_interval, TcpStream::connect(&addr));
                if let Ok(Ok(_)) = probe.await {
                    tracing::debug!(%addr, attempt, "instance accepting connections");
                    return Ok(true);
                }
                if attempt < self.probe_attempts {
                    tokio::time::sleep(self.probe_interval).await;
                }
            }
            Ok(false)
        })
    }
}

/// Packs a directory with `tar -czf`.
pub struct TarCompressor {
    pub out_dir: PathBuf,
}

impl TarCompressor {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    fn archive_path(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".into());
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        self.out_dir.join(format!("{stem}-{stamp}.tar.gz"))
    }
}

impl Compressor for TarCompressor {
    fn compress_directory<'a>(
        &'a self,
        source: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, BackupError>> {
        Box::pin(async move {
            let (Some(parent), Some(name)) = (source.parent(), source.file_name()) else {
                return Err(BackupError::Compression(format!(
                    "cannot archive {}",
                    source.display()
                )));
            };
            tokio::fs::create_dir_all(&self.out_dir).await?;
            let archive = self.archive_path(source);

            let output = Command::new("tar")
                .arg("-czf")
                .arg(&archive)
                .arg("-C")
                .arg(parent)
                .arg(name)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| BackupError::Compression(format!("failed to run tar: {e}")))?;

            if !output.status.success() {
                let _ = tokio::fs::remove_file(&archive).await;
                return Err(BackupError::Compression(format!(
                    "tar exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Ok(archive)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn availability_probe_finds_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let service = SystemctlService {
            probe_attempts: 2,
            probe_interval: Duration::from_millis(200),
        };
        let conn = ConnectionInfo {
            host: "127.0.0.1".into(),
            port,
        };
        assert!(service.verify_availability(&conn).await.unwrap());
    }

    #[tokio::test]
    async fn availability_probe_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let service = SystemctlService {
            probe_attempts: 2,
            probe_interval: Duration::from_millis(10),
        };
        let conn = ConnectionInfo {
            host: "127.0.0.1".into(),
            port,
        };
        assert!(!service.verify_availability(&conn).await.unwrap());
    }

    #[tokio::test]
    async fn tar_archives_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("mysql");
        std::fs::create_dir_all(data_dir.join("db1")).unwrap();
        std::fs::write(data_dir.join("db1").join("t.ibd"), vec![7u8; 4096]).unwrap();

        let compressor = TarCompressor::new(tmp.path().join("out"));
        let archive = compressor.compress_directory(&data_dir).await.unwrap();

        assert!(archive.starts_with(tmp.path().join("out")));
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("mysql-") && name.ends_with(".tar.gz"));
        assert!(std::fs::metadata(&archive).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn tar_reports_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let compressor = TarCompressor::new(tmp.path().join("out"));
        let err = compressor
            .compress_directory(&tmp.path().join("absent"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Compression(_)));
    }
}
