use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, FileMetadata};

// ---------------------------------------------------------------------------
// Client -> receiver
// ---------------------------------------------------------------------------

/// Opens a transfer, or resumes one when `resume_token` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInit {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub file_checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub protocol_version: u32,
}

impl TransferInit {
    /// Builds an initiation message for `metadata`.
    pub fn new(metadata: &FileMetadata, resume_token: Option<String>) -> Self {
        Self {
            file_name: metadata.file_name.clone(),
            total_size: metadata.total_size,
            chunk_size: metadata.chunk_size,
            file_checksum: metadata.file_checksum.clone(),
            resume_token,
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }

    /// The file identity and layout carried by this message.
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            file_name: self.file_name.clone(),
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            file_checksum: self.file_checksum.clone(),
        }
    }
}

/// Joins an additional connection to an already-initiated transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    pub transfer_id: String,
    pub resume_token: String,
}

/// Header of a chunk frame. The payload (`chunk_size` bytes) follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub chunk_size: u64,
    pub chunk_checksum: String,
    pub is_last_chunk: bool,
}

/// Asks the receiver to assemble and verify a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub transfer_id: String,
}

/// Asks for the completed chunk set of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub transfer_id: String,
}

// ---------------------------------------------------------------------------
// Receiver -> client
// ---------------------------------------------------------------------------

/// Reply to [`TransferInit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAccepted {
    pub transfer_id: String,
    pub resume_token: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// Indices already confirmed (empty for a fresh transfer).
    #[serde(default)]
    pub completed_chunks: Vec<u32>,
}

/// Reply to [`AttachRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachAccepted {
    pub transfer_id: String,
}

/// Per-chunk acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub completed_chunks: u32,
    pub total_chunks: u32,
}

impl ChunkResponse {
    /// Whether this acknowledgement leaves every chunk confirmed.
    pub fn all_confirmed(&self) -> bool {
        self.accepted && self.total_chunks > 0 && self.completed_chunks == self.total_chunks
    }
}

/// Result of assembling and verifying a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub transfer_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Reply to [`StatusRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub transfer_id: String,
    pub completed_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub is_completed: bool,
}

/// Connection-level error. The receiver closes the connection after sending
/// one unless the error concerns a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> FileMetadata {
        FileMetadata {
            file_name: "mysql-2026-10-19.tar.gz".into(),
            total_size: 110_100_480,
            chunk_size: 52_428_800,
            file_checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn init_roundtrip_preserves_metadata() {
        let init = TransferInit::new(&sample_metadata(), None);
        assert_eq!(init.metadata(), sample_metadata());
        assert_eq!(init.protocol_version, crate::PROTOCOL_VERSION);

        let json = serde_json::to_string(&init).unwrap();
        assert!(!json.contains("resumeToken"));
        let parsed: TransferInit = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, init);
    }

    #[test]
    fn init_with_resume_token() {
        let init = TransferInit::new(&sample_metadata(), Some("f00d".into()));
        let json = serde_json::to_value(&init).unwrap();
        assert_eq!(json["resumeToken"], "f00d");
    }

    #[test]
    fn chunk_message_field_names() {
        let msg = ChunkMessage {
            transfer_id: "t1".into(),
            chunk_index: 2,
            chunk_size: 5,
            chunk_checksum: "cd".repeat(32),
            is_last_chunk: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["transferId"], "t1");
        assert_eq!(json["chunkIndex"], 2);
        assert_eq!(json["chunkSize"], 5);
        assert_eq!(json["isLastChunk"], true);
    }

    #[test]
    fn chunk_response_rejection_carries_kind() {
        let resp = ChunkResponse {
            transfer_id: "t1".into(),
            chunk_index: 0,
            accepted: false,
            reason: Some("checksum mismatch".into()),
            error_kind: Some(ErrorKind::Integrity),
            completed_chunks: 0,
            total_chunks: 3,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"errorKind\":\"integrity\""));
        assert!(!resp.all_confirmed());
    }

    #[test]
    fn chunk_response_all_confirmed() {
        let resp = ChunkResponse {
            transfer_id: "t1".into(),
            chunk_index: 1,
            accepted: true,
            reason: None,
            error_kind: None,
            completed_chunks: 3,
            total_chunks: 3,
        };
        assert!(resp.all_confirmed());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn finalize_response_defaults_when_fields_missing() {
        let parsed: FinalizeResponse =
            serde_json::from_str(r#"{"transferId":"t1","success":true}"#).unwrap();
        assert!(parsed.success);
        assert!(parsed.final_checksum.is_none());
        assert!(parsed.error.is_none());
    }

    #[test]
    fn accepted_defaults_completed_chunks() {
        let parsed: TransferAccepted = serde_json::from_str(
            r#"{"transferId":"t1","resumeToken":"r","chunkSize":4,"totalChunks":2}"#,
        )
        .unwrap();
        assert!(parsed.completed_chunks.is_empty());
    }
}
