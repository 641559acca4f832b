use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use dbshuttle_protocol::FileMetadata;

use crate::TransferError;
use crate::checksum::checksum_reader;
use crate::chunked::ChunkWriter;
use crate::types::ResumeToken;

/// Name of the reassembled file inside a transfer's partial directory.
pub const ASSEMBLED_FILE_NAME: &str = "assembled";

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Concatenates `chunk_0..chunk_{n-1}` from `partial_dir` into
/// `partial_dir/assembled`, hashing as it writes.
///
/// Returns the assembled path when the SHA-256 matches `file.file_checksum`.
/// On mismatch the assembled file is removed and the chunk files are left in
/// place. Blocking; call from `spawn_blocking`.
pub fn reassemble_blocking(partial_dir: &Path, file: &FileMetadata) -> Result<PathBuf, TransferError> {
    let chunks = ChunkWriter::new(partial_dir);
    let assembled = partial_dir.join(ASSEMBLED_FILE_NAME);

    let result = write_assembled(&chunks, &assembled, file);
    let actual = match result {
        Ok(actual) => actual,
        Err(e) => {
            let _ = std::fs::remove_file(&assembled);
            return Err(e);
        }
    };

    if !actual.eq_ignore_ascii_case(&file.file_checksum) {
        warn!(
            file = %file.file_name,
            expected = %file.file_checksum,
            actual = %actual,
            "reassembled file failed verification"
        );
        let _ = std::fs::remove_file(&assembled);
        return Err(TransferError::Integrity {
            expected: file.file_checksum.clone(),
            actual,
        });
    }
    Ok(assembled)
}

/// Re-reads every recorded chunk under `partial_dir` and returns the indices
/// whose file is missing or no longer matches the recorded size and checksum.
/// Blocking; call from `spawn_blocking`.
pub fn audit_chunks_blocking(
    partial_dir: &Path,
    record: &ResumeToken,
) -> Result<Vec<u32>, TransferError> {
    let chunks = ChunkWriter::new(partial_dir);
    let mut bad = Vec::new();
    for (&index, recorded) in &record.completed_chunks {
        if !chunks.has_chunk(index) {
            bad.push(index);
            continue;
        }
        let path = chunks.chunk_path(index);
        if std::fs::metadata(&path)?.len() != recorded.size {
            bad.push(index);
            continue;
        }
        let actual = checksum_reader(File::open(&path)?)?;
        if !actual.eq_ignore_ascii_case(&recorded.checksum) {
            bad.push(index);
        }
    }
    Ok(bad)
}

fn write_assembled(
    chunks: &ChunkWriter,
    assembled: &Path,
    file: &FileMetadata,
) -> Result<String, TransferError> {
    let mut out = BufWriter::new(File::create(assembled)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;

    for index in 0..file.total_chunks() {
        let mut part = File::open(chunks.chunk_path(index))?;
        let expected = file.chunk_len(index);
        let mut copied = 0u64;
        loop {
            let n = part.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            copied += n as u64;
        }
        if copied != expected {
            return Err(TransferError::InvalidChunk(format!(
                "chunk {index} is {copied} bytes, expected {expected}"
            )));
        }
        written += copied;
    }

    if written != file.total_size {
        return Err(TransferError::InvalidChunk(format!(
            "assembled {written} bytes, expected {}",
            file.total_size
        )));
    }

    let out = out.into_inner().map_err(|e| e.into_error())?;
    out.sync_all()?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::types::Chunk;
    use tempfile::TempDir;

    fn layout(data: &[u8], chunk_size: u64) -> FileMetadata {
        FileMetadata {
            file_name: "db.tar.gz".into(),
            total_size: data.len() as u64,
            chunk_size,
            file_checksum: checksum_bytes(data),
        }
    }

    fn write_chunks(dir: &Path, data: &[u8], meta: &FileMetadata) {
        let writer = ChunkWriter::new(dir);
        for index in 0..meta.total_chunks() {
            let start = meta.chunk_offset(index) as usize;
            let end = start + meta.chunk_len(index) as usize;
            let bytes = data[start..end].to_vec();
            writer
                .write_chunk(&Chunk {
                    index,
                    offset: start as u64,
                    checksum: checksum_bytes(&bytes),
                    data: bytes,
                    is_last: meta.is_last_chunk(index),
                })
                .unwrap();
        }
    }

    #[test]
    fn reassembles_in_index_order() {
        let dir = TempDir::new().unwrap();
        let data = b"0123456789abcdefghij-tail";
        let meta = layout(data, 7);
        write_chunks(dir.path(), data, &meta);

        let path = reassemble_blocking(dir.path(), &meta).unwrap();
        assert_eq!(path, dir.path().join(ASSEMBLED_FILE_NAME));
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert!(dir.path().join("chunk_0").exists());
    }

    #[test]
    fn reassembles_empty_file() {
        let dir = TempDir::new().unwrap();
        let meta = layout(b"", 4);
        write_chunks(dir.path(), b"", &meta);

        let path = reassemble_blocking(dir.path(), &meta).unwrap();
        assert_eq!(std::fs::metadata(path).unwrap().len(), 0);
    }

    #[test]
    fn checksum_mismatch_removes_assembled_keeps_chunks() {
        let dir = TempDir::new().unwrap();
        let data = b"some archive bytes";
        let mut meta = layout(data, 5);
        write_chunks(dir.path(), data, &meta);
        meta.file_checksum = checksum_bytes(b"something else");

        let err = reassemble_blocking(dir.path(), &meta).unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));
        assert!(!dir.path().join(ASSEMBLED_FILE_NAME).exists());
        assert!(dir.path().join("chunk_0").exists());
    }

    #[test]
    fn missing_chunk_file_fails() {
        let dir = TempDir::new().unwrap();
        let data = b"abcdefgh";
        let meta = layout(data, 4);
        write_chunks(dir.path(), data, &meta);
        std::fs::remove_file(dir.path().join("chunk_1")).unwrap();

        let err = reassemble_blocking(dir.path(), &meta).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert!(!dir.path().join(ASSEMBLED_FILE_NAME).exists());
    }

    fn recorded(data: &[u8], meta: &FileMetadata) -> ResumeToken {
        let now = chrono::Utc::now();
        let completed_chunks = (0..meta.total_chunks())
            .map(|index| {
                let start = meta.chunk_offset(index) as usize;
                let bytes = &data[start..start + meta.chunk_len(index) as usize];
                let fact = crate::types::CompletedChunk {
                    size: bytes.len() as u64,
                    checksum: checksum_bytes(bytes),
                };
                (index, fact)
            })
            .collect();
        ResumeToken {
            token: "a".repeat(32),
            transfer_id: "t1".into(),
            file: meta.clone(),
            completed_chunks,
            is_completed: false,
            created_at: now,
            last_activity: now,
        }
    }

    #[test]
    fn audit_passes_intact_chunks() {
        let dir = TempDir::new().unwrap();
        let data = b"0123456789abcdef";
        let meta = layout(data, 4);
        write_chunks(dir.path(), data, &meta);

        let bad = audit_chunks_blocking(dir.path(), &recorded(data, &meta)).unwrap();
        assert!(bad.is_empty());
    }

    #[test]
    fn audit_reports_missing_and_altered_chunks() {
        let dir = TempDir::new().unwrap();
        let data = b"0123456789abcdef";
        let meta = layout(data, 4);
        write_chunks(dir.path(), data, &meta);
        std::fs::remove_file(dir.path().join("chunk_0")).unwrap();
        std::fs::write(dir.path().join("chunk_2"), b"89AB").unwrap();
        std::fs::write(dir.path().join("chunk_3"), b"cd").unwrap();

        let bad = audit_chunks_blocking(dir.path(), &recorded(data, &meta)).unwrap();
        assert_eq!(bad, vec![0, 2, 3]);
    }

    #[test]
    fn wrong_sized_chunk_fails() {
        let dir = TempDir::new().unwrap();
        let data = b"abcdefgh";
        let meta = layout(data, 4);
        write_chunks(dir.path(), data, &meta);
        std::fs::write(dir.path().join("chunk_0"), b"abc").unwrap();

        let err = reassemble_blocking(dir.path(), &meta).unwrap_err();
        assert!(matches!(err, TransferError::InvalidChunk(_)));
    }
}
