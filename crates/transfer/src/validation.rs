use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a file name is a single plain path component.
///
/// Archives land directly in the receiver's storage root, so anything that
/// could address another directory is rejected:
/// - Empty names, `.` and `..`
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
/// - Any separator (`/`, `\`)
/// - Names starting with `.` (reserved for in-progress state)
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if file_name.contains(['/', '\\']) {
        return Err(TransferError::InvalidPath(format!(
            "separators not allowed: {file_name}"
        )));
    }
    if file_name.starts_with('.') {
        return Err(TransferError::InvalidPath(format!(
            "hidden names not allowed: {file_name}"
        )));
    }
    if file_name.len() >= 2 && file_name.as_bytes()[1] == b':' {
        return Err(TransferError::InvalidPath(format!(
            "drive prefix not allowed: {file_name}"
        )));
    }

    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidPath(format!(
            "not a plain file name: {file_name}"
        ))),
    }
}

/// Validates a SHA-256 hex digest (64 hex characters).
pub fn validate_checksum(checksum: &str) -> Result<(), TransferError> {
    if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TransferError::InvalidMetadata(format!(
            "checksum must be 64 hex characters, got {:?}",
            checksum
        )));
    }
    Ok(())
}
