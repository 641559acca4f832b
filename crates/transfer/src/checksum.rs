use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use dbshuttle_protocol::FileMetadata;

use crate::TransferError;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Returns `true` if `data` hashes to `expected` (hex, case-insensitive).
pub fn verify_bytes(data: &[u8], expected: &str) -> bool {
    checksum_bytes(data).eq_ignore_ascii_case(expected)
}

/// Streams `reader` to EOF and returns the hex-encoded SHA-256 digest.
pub fn checksum_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let file = std::fs::File::open(path)?;
    Ok(checksum_reader(file)?)
}

/// Runs [`calculate_file_checksum`] on the blocking pool.
pub async fn calculate_file_checksum_async(path: PathBuf) -> Result<String, TransferError> {
    tokio::task::spawn_blocking(move || calculate_file_checksum(&path))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
}

/// Derives the transfer ID from the file identity.
///
/// The same file (name, size, layout and content digest) always maps to the
/// same ID, which lets the registry refuse a second concurrent transfer of it.
pub fn transfer_id_for(metadata: &FileMetadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(metadata.file_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(metadata.total_size.to_be_bytes());
    hasher.update(metadata.chunk_size.to_be_bytes());
    hasher.update(metadata.file_checksum.to_ascii_lowercase().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64);
        assert_eq!(
            c1,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn checksum_bytes_different_data() {
        assert_ne!(checksum_bytes(b"hello"), checksum_bytes(b"world"));
    }

    #[test]
    fn verify_bytes_accepts_uppercase_hex() {
        let digest = checksum_bytes(b"chunk").to_uppercase();
        assert!(verify_bytes(b"chunk", &digest));
        assert!(!verify_bytes(b"chunk!", &digest));
    }

    #[test]
    fn file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.bin");
        let data = vec![7u8; READ_BUF_SIZE * 2 + 13];
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(&data));
    }

    #[tokio::test]
    async fn async_file_checksum_matches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.bin");
        std::fs::write(&path, b"abc").unwrap();
        let digest = calculate_file_checksum_async(path).await.unwrap();
        assert_eq!(digest, checksum_bytes(b"abc"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = calculate_file_checksum(Path::new("/nonexistent/dbshuttle")).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[test]
    fn transfer_id_depends_on_identity() {
        let meta = FileMetadata {
            file_name: "a.tar.gz".into(),
            total_size: 10,
            chunk_size: 4,
            file_checksum: "ab".repeat(32),
        };
        let id = transfer_id_for(&meta);
        assert_eq!(id.len(), 32);
        assert_eq!(id, transfer_id_for(&meta.clone()));

        let other = FileMetadata {
            chunk_size: 5,
            ..meta.clone()
        };
        assert_ne!(id, transfer_id_for(&other));

        let upper = FileMetadata {
            file_checksum: meta.file_checksum.to_uppercase(),
            ..meta
        };
        assert_eq!(id, transfer_id_for(&upper));
    }
}
