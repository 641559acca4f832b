fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use dbshuttle_backup::{BackupOutcome, BackupStatus};
    use dbshuttle_data_channel::Frame;
    use dbshuttle_data_channel::wire::{read_frame, write_frame};
    use dbshuttle_protocol::{
        AttachAccepted, AttachRequest, ChunkMessage, ChunkResponse, ErrorKind, ErrorResponse,
        FinalizeRequest, FinalizeResponse, StatusRequest, TransferAccepted, TransferInit,
        TransferStatus,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn parse<T: serde::de::DeserializeOwned>(name: &str) -> T {
        serde_json::from_value(load_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent). Returns the parsed value.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Client -> receiver ---

    #[test]
    fn fixture_transfer_init() {
        let init = roundtrip_test::<TransferInit>("transfer_init.json");
        assert!(init.resume_token.is_none());
        assert_eq!(init.metadata().total_chunks(), 3);
    }

    #[test]
    fn fixture_transfer_init_resume() {
        let init = roundtrip_test::<TransferInit>("transfer_init_resume.json");
        assert_eq!(init.resume_token.as_deref().map(str::len), Some(32));
    }

    #[test]
    fn fixture_attach_request() {
        roundtrip_test::<AttachRequest>("attach_request.json");
    }

    #[test]
    fn fixture_chunk_message() {
        let msg = roundtrip_test::<ChunkMessage>("chunk_message.json");
        assert!(msg.is_last_chunk);
    }

    #[test]
    fn fixture_finalize_request() {
        roundtrip_test::<FinalizeRequest>("finalize_request.json");
    }

    #[test]
    fn fixture_status_request() {
        roundtrip_test::<StatusRequest>("status_request.json");
    }

    // --- Receiver -> client ---

    #[test]
    fn fixture_transfer_accepted() {
        let accepted = roundtrip_test::<TransferAccepted>("transfer_accepted.json");
        assert_eq!(accepted.completed_chunks, vec![0, 2]);
    }

    #[test]
    fn fixture_attach_accepted() {
        roundtrip_test::<AttachAccepted>("attach_accepted.json");
    }

    #[test]
    fn fixture_chunk_response_accepted() {
        let ack = roundtrip_test::<ChunkResponse>("chunk_response_accepted.json");
        assert!(ack.all_confirmed());
    }

    #[test]
    fn fixture_chunk_response_rejected() {
        let ack = roundtrip_test::<ChunkResponse>("chunk_response_rejected.json");
        assert_eq!(ack.error_kind, Some(ErrorKind::Integrity));
        assert!(!ack.all_confirmed());
    }

    #[test]
    fn fixture_finalize_response_success() {
        roundtrip_test::<FinalizeResponse>("finalize_response_success.json");
    }

    #[test]
    fn fixture_finalize_response_failure() {
        let resp = roundtrip_test::<FinalizeResponse>("finalize_response_failure.json");
        assert_eq!(resp.error_kind, Some(ErrorKind::Protocol));
    }

    #[test]
    fn fixture_transfer_status() {
        roundtrip_test::<TransferStatus>("transfer_status.json");
    }

    #[test]
    fn fixture_error_response() {
        let err = roundtrip_test::<ErrorResponse>("error_response.json");
        assert!(err.kind.is_retryable());
    }

    // --- Outcome log ---

    #[test]
    fn fixture_backup_outcome() {
        let outcome = roundtrip_test::<BackupOutcome>("backup_outcome.json");
        assert_eq!(outcome.status, BackupStatus::Interrupted);
        assert!(outcome.resume_point().is_some());
    }

    // --- Framing ---

    #[tokio::test]
    async fn frame_carries_fixture_header() {
        let fixture = load_fixture("chunk_message.json");
        let msg: ChunkMessage = serde_json::from_value(fixture.clone()).unwrap();
        let payload = vec![0x5au8; 16];
        let frame = Frame::Chunk(
            ChunkMessage {
                chunk_size: payload.len() as u64,
                ..msg
            },
            payload.clone(),
        );

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        assert_eq!(buf[0], 0x03);
        let header_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let header: serde_json::Value = serde_json::from_slice(&buf[5..5 + header_len]).unwrap();
        assert_eq!(header["transferId"], fixture["transferId"]);
        assert_eq!(header["chunkSize"], 16);
        assert_eq!(&buf[5 + header_len..], &payload[..]);

        let mut cursor = &buf[..];
        assert_eq!(read_frame(&mut cursor, 1024).await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn control_frame_kinds() {
        let cases = [
            (Frame::Init(parse("transfer_init.json")), 0x01),
            (Frame::Attach(parse("attach_request.json")), 0x02),
            (Frame::Finalize(parse("finalize_request.json")), 0x04),
            (Frame::Status(parse("status_request.json")), 0x05),
            (Frame::InitAck(parse("transfer_accepted.json")), 0x81),
            (Frame::AttachAck(parse("attach_accepted.json")), 0x82),
            (Frame::ChunkAck(parse("chunk_response_accepted.json")), 0x83),
            (Frame::Finalized(parse("finalize_response_success.json")), 0x84),
            (Frame::StatusAck(parse("transfer_status.json")), 0x85),
            (Frame::Error(parse("error_response.json")), 0xFF),
        ];
        for (frame, kind) in cases {
            let mut buf = Vec::new();
            write_frame(&mut buf, &frame).await.unwrap();
            assert_eq!(buf[0], kind, "{:?}", frame.kind());
            let mut cursor = &buf[..];
            assert_eq!(read_frame(&mut cursor, 0).await.unwrap(), Some(frame));
        }
    }
}
