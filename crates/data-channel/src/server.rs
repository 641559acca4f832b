//! TCP file receiver (server side).
//!
//! Accepts any number of connections; each runs in its own task. A connection
//! opens with `Init` (new or resumed transfer) or `Attach` (extra worker for a
//! transfer already opened), then carries `Chunk`, `Finalize` and `Status`
//! frames for that transfer until the client closes it. Closing a connection
//! never discards anything already recorded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dbshuttle_protocol::{
    AttachAccepted, ChunkMessage, ChunkResponse, ErrorKind, ErrorResponse, FinalizeResponse,
    PROTOCOL_VERSION, TransferAccepted, TransferInit, TransferStatus,
};
use dbshuttle_transfer::{ChunkStore, TransferError};

use crate::TCP_BUFFER_SIZE;
use crate::error::DataChannelError;
use crate::wire::{Frame, read_frame, write_frame};

/// Hint sent with transient rejections.
const TRANSIENT_RETRY_AFTER_MS: u64 = 1000;

/// Receives chunked transfers into a [`ChunkStore`].
pub struct FileReceiver {
    store: Arc<ChunkStore>,
    io_timeout: Duration,
    cancel: CancellationToken,
}

impl FileReceiver {
    pub fn new(store: Arc<ChunkStore>, io_timeout: Duration, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            store,
            io_timeout,
            cancel,
        })
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Stops accepting connections and closes open ones at their next read.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accepts connections on `listener` until cancellation.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), DataChannelError> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "file receiver listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("file receiver shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let receiver = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = receiver.handle_connection(stream, peer_addr).await {
                                    match e.kind() {
                                        ErrorKind::Transient => warn!(%peer_addr, "connection ended: {e}"),
                                        _ => error!(%peer_addr, "connection error: {e}"),
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), DataChannelError> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
        let mut writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, writer);
        debug!(%peer_addr, "connection accepted");

        let Some(hello) = self.next_frame(&mut reader, &mut writer).await? else {
            return Ok(());
        };
        let transfer_id = match hello {
            Frame::Init(init) => match self.open_transfer(init).await {
                Ok(accepted) => {
                    let id = accepted.transfer_id.clone();
                    info!(
                        %peer_addr,
                        transfer_id = %id,
                        completed = accepted.completed_chunks.len(),
                        total = accepted.total_chunks,
                        "transfer opened"
                    );
                    write_frame(&mut writer, &Frame::InitAck(accepted)).await?;
                    id
                }
                Err(e) => {
                    send_error(&mut writer, &e).await?;
                    return Err(e);
                }
            },
            Frame::Attach(req) => match self.store.attach(&req.transfer_id, &req.resume_token) {
                Ok(_) => {
                    debug!(%peer_addr, transfer_id = %req.transfer_id, "worker attached");
                    let ack = AttachAccepted {
                        transfer_id: req.transfer_id.clone(),
                    };
                    write_frame(&mut writer, &Frame::AttachAck(ack)).await?;
                    req.transfer_id
                }
                Err(e) => {
                    let e = DataChannelError::from(e);
                    send_error(&mut writer, &e).await?;
                    return Err(e);
                }
            },
            other => {
                let e = DataChannelError::Protocol(format!(
                    "expected Init or Attach, got {:?}",
                    other.kind()
                ));
                send_error(&mut writer, &e).await?;
                return Err(e);
            }
        };

        while let Some(frame) = self.next_frame(&mut reader, &mut writer).await? {
            match frame {
                Frame::Chunk(msg, data) => {
                    let ready = self.handle_chunk(&transfer_id, msg, data, &mut writer).await?;
                    if ready {
                        let response = self.finalize(&transfer_id).await;
                        write_frame(&mut writer, &Frame::Finalized(response)).await?;
                    }
                }
                Frame::Finalize(req) => {
                    let response = if req.transfer_id == transfer_id {
                        self.finalize(&transfer_id).await
                    } else {
                        finalize_failure(&req.transfer_id, &other_transfer(&req.transfer_id))
                    };
                    write_frame(&mut writer, &Frame::Finalized(response)).await?;
                }
                Frame::Status(req) => {
                    let status = if req.transfer_id == transfer_id {
                        self.store.status(&transfer_id).map_err(DataChannelError::from)
                    } else {
                        Err(other_transfer(&req.transfer_id))
                    };
                    match status {
                        Ok(record) => {
                            let status = TransferStatus {
                                transfer_id: record.transfer_id.clone(),
                                completed_chunks: record.completed_indices().into_iter().collect(),
                                total_chunks: record.total_chunks(),
                                is_completed: record.is_completed,
                            };
                            write_frame(&mut writer, &Frame::StatusAck(status)).await?;
                        }
                        Err(e) => send_error(&mut writer, &e).await?,
                    }
                }
                other => {
                    let e = DataChannelError::Protocol(format!(
                        "unexpected {:?} frame",
                        other.kind()
                    ));
                    send_error(&mut writer, &e).await?;
                    return Err(e);
                }
            }
        }

        debug!(%peer_addr, transfer_id = %transfer_id, "connection closed by client");
        Ok(())
    }

    /// Reads the next frame under the I/O timeout. Malformed frames are
    /// answered with an error frame before the connection is dropped.
    async fn next_frame<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<Option<Frame>, DataChannelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DataChannelError::Cancelled),
            result = tokio::time::timeout(
                self.io_timeout,
                read_frame(reader, self.store.max_chunk_size()),
            ) => match result {
                Ok(r) => r,
                Err(_) => return Err(DataChannelError::Timeout),
            },
        };
        match result {
            Err(e @ (DataChannelError::Protocol(_) | DataChannelError::Json(_))) => {
                send_error(writer, &e).await?;
                Err(e)
            }
            other => other,
        }
    }

    async fn open_transfer(&self, init: TransferInit) -> Result<TransferAccepted, DataChannelError> {
        if init.protocol_version != PROTOCOL_VERSION {
            return Err(DataChannelError::Protocol(format!(
                "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
                init.protocol_version
            )));
        }
        let meta = init.metadata();
        let ticket = match &init.resume_token {
            Some(token) => self.store.resume_transfer(token, &meta).await?,
            None => self.store.initialize_transfer(meta.clone()).await?,
        };
        Ok(TransferAccepted {
            transfer_id: ticket.transfer_id,
            resume_token: ticket.token,
            chunk_size: meta.chunk_size,
            total_chunks: ticket.total_chunks,
            completed_chunks: ticket.completed.into_iter().collect(),
        })
    }

    /// Stores one chunk and acknowledges it. Returns whether every chunk of the
    /// transfer is now present.
    async fn handle_chunk<W: AsyncWrite + Unpin>(
        &self,
        transfer_id: &str,
        msg: ChunkMessage,
        data: Vec<u8>,
        writer: &mut W,
    ) -> Result<bool, DataChannelError> {
        let result = if msg.transfer_id == transfer_id {
            self.store.receive_chunk(&msg, data).await.map_err(DataChannelError::from)
        } else {
            Err(other_transfer(&msg.transfer_id))
        };

        let (ack, ready) = match result {
            Ok(progress) => (
                ChunkResponse {
                    transfer_id: msg.transfer_id.clone(),
                    chunk_index: msg.chunk_index,
                    accepted: true,
                    reason: None,
                    error_kind: None,
                    completed_chunks: progress.completed_chunks,
                    total_chunks: progress.total_chunks,
                },
                progress.is_ready(),
            ),
            Err(e) => {
                warn!(
                    transfer_id = %msg.transfer_id,
                    chunk = msg.chunk_index,
                    kind = %e.kind(),
                    "chunk rejected: {e}"
                );
                let progress = self.store.progress(transfer_id).ok();
                (
                    ChunkResponse {
                        transfer_id: msg.transfer_id.clone(),
                        chunk_index: msg.chunk_index,
                        accepted: false,
                        reason: Some(e.to_string()),
                        error_kind: Some(e.kind()),
                        completed_chunks: progress.map_or(0, |p| p.completed_chunks),
                        total_chunks: progress.map_or(0, |p| p.total_chunks),
                    },
                    false,
                )
            }
        };
        write_frame(writer, &Frame::ChunkAck(ack)).await?;
        Ok(ready)
    }

    async fn finalize(&self, transfer_id: &str) -> FinalizeResponse {
        match self.store.finalize_transfer(transfer_id).await {
            Ok(finalized) => FinalizeResponse {
                transfer_id: transfer_id.to_string(),
                success: true,
                final_checksum: Some(finalized.checksum),
                error: None,
                error_kind: None,
            },
            Err(e) => {
                if !matches!(e, TransferError::Incomplete { .. }) {
                    error!(transfer_id = %transfer_id, "finalize failed: {e}");
                }
                finalize_failure(transfer_id, &DataChannelError::from(e))
            }
        }
    }
}

fn other_transfer(transfer_id: &str) -> DataChannelError {
    DataChannelError::Protocol(format!(
        "connection is not attached to transfer {transfer_id}"
    ))
}

fn finalize_failure(transfer_id: &str, e: &DataChannelError) -> FinalizeResponse {
    FinalizeResponse {
        transfer_id: transfer_id.to_string(),
        success: false,
        final_checksum: None,
        error: Some(e.to_string()),
        error_kind: Some(e.kind()),
    }
}

async fn send_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    e: &DataChannelError,
) -> Result<(), DataChannelError> {
    let kind = e.kind();
    let response = ErrorResponse {
        kind,
        message: e.to_string(),
        retry_after_ms: (kind == ErrorKind::Transient).then_some(TRANSIENT_RETRY_AFTER_MS),
    };
    write_frame(writer, &Frame::Error(response)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbshuttle_protocol::{AttachRequest, FileMetadata, FinalizeRequest, StatusRequest};
    use dbshuttle_transfer::{ResumeRegistry, checksum_bytes};
    use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};

    struct Harness {
        _dir: tempfile::TempDir,
        receiver: Arc<FileReceiver>,
        addr: SocketAddr,
    }

    async fn start(io_timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ResumeRegistry::in_memory());
        let store = Arc::new(ChunkStore::new(dir.path(), registry, 1024).unwrap());
        let receiver = FileReceiver::new(store, io_timeout, CancellationToken::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let r = Arc::clone(&receiver);
        tokio::spawn(async move { r.serve(listener).await });
        Harness {
            _dir: dir,
            receiver,
            addr,
        }
    }

    type Conn = (ReadHalf<TcpStream>, WriteHalf<TcpStream>);

    async fn connect(addr: SocketAddr) -> Conn {
        tokio::io::split(TcpStream::connect(addr).await.unwrap())
    }

    async fn roundtrip(conn: &mut Conn, frame: Frame) -> Frame {
        write_frame(&mut conn.1, &frame).await.unwrap();
        read_frame(&mut conn.0, 0).await.unwrap().unwrap()
    }

    fn meta(data: &[u8], chunk_size: u64) -> FileMetadata {
        FileMetadata {
            file_name: "backup.tar.gz".into(),
            total_size: data.len() as u64,
            chunk_size,
            file_checksum: checksum_bytes(data),
        }
    }

    fn chunk(meta: &FileMetadata, id: &str, data: &[u8], index: u32) -> Frame {
        let start = meta.chunk_offset(index) as usize;
        let bytes = data[start..start + meta.chunk_len(index) as usize].to_vec();
        Frame::Chunk(
            ChunkMessage {
                transfer_id: id.into(),
                chunk_index: index,
                chunk_size: bytes.len() as u64,
                chunk_checksum: checksum_bytes(&bytes),
                is_last_chunk: meta.is_last_chunk(index),
            },
            bytes,
        )
    }

    async fn open(conn: &mut Conn, meta: &FileMetadata) -> TransferAccepted {
        match roundtrip(conn, Frame::Init(TransferInit::new(meta, None))).await {
            Frame::InitAck(a) => a,
            other => panic!("expected InitAck, got {other:?}"),
        }
    }

    fn ack(frame: Frame) -> ChunkResponse {
        match frame {
            Frame::ChunkAck(a) => a,
            other => panic!("expected ChunkAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_finalize_automatically() {
        let h = start(Duration::from_secs(5)).await;
        let data = b"chunk zero|chunk one|chunk two";
        let meta = meta(data, 10);
        let mut conn = connect(h.addr).await;
        let accepted = open(&mut conn, &meta).await;
        assert_eq!(accepted.total_chunks, 3);
        let id = accepted.transfer_id;

        assert!(ack(roundtrip(&mut conn, chunk(&meta, &id, data, 0)).await).accepted);
        assert!(ack(roundtrip(&mut conn, chunk(&meta, &id, data, 2)).await).accepted);
        let last = ack(roundtrip(&mut conn, chunk(&meta, &id, data, 1)).await);
        assert!(last.all_confirmed());

        match read_frame(&mut conn.0, 0).await.unwrap().unwrap() {
            Frame::Finalized(resp) => {
                assert!(resp.success);
                assert_eq!(resp.final_checksum.as_deref(), Some(meta.file_checksum.as_str()));
            }
            other => panic!("expected Finalized, got {other:?}"),
        }
        let path = h.receiver.store().root().join("backup.tar.gz");
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[tokio::test]
    async fn corrupt_chunk_rejected_with_integrity_kind() {
        let h = start(Duration::from_secs(5)).await;
        let data = b"0123456789";
        let meta = meta(data, 4);
        let mut conn = connect(h.addr).await;
        let id = open(&mut conn, &meta).await.transfer_id;

        let Frame::Chunk(msg, mut bytes) = chunk(&meta, &id, data, 1) else {
            unreachable!()
        };
        bytes[0] ^= 0xFF;
        let resp = ack(roundtrip(&mut conn, Frame::Chunk(msg, bytes)).await);
        assert!(!resp.accepted);
        assert_eq!(resp.error_kind, Some(ErrorKind::Integrity));
        assert_eq!(resp.completed_chunks, 0);

        // Connection stays usable after a chunk-level rejection.
        let resp = ack(roundtrip(&mut conn, chunk(&meta, &id, data, 1)).await);
        assert!(resp.accepted);
        assert_eq!(resp.completed_chunks, 1);
    }

    #[tokio::test]
    async fn explicit_finalize_with_missing_chunk() {
        let h = start(Duration::from_secs(5)).await;
        let data = b"0123456789";
        let meta = meta(data, 4);
        let mut conn = connect(h.addr).await;
        let id = open(&mut conn, &meta).await.transfer_id;
        ack(roundtrip(&mut conn, chunk(&meta, &id, data, 0)).await);

        let frame = Frame::Finalize(FinalizeRequest {
            transfer_id: id.clone(),
        });
        match roundtrip(&mut conn, frame).await {
            Frame::Finalized(resp) => {
                assert!(!resp.success);
                assert_eq!(resp.error_kind, Some(ErrorKind::Protocol));
            }
            other => panic!("expected Finalized, got {other:?}"),
        }
        assert!(!h.receiver.store().root().join("backup.tar.gz").exists());
    }

    #[tokio::test]
    async fn attach_and_status() {
        let h = start(Duration::from_secs(5)).await;
        let data = b"0123456789";
        let meta = meta(data, 4);
        let mut control = connect(h.addr).await;
        let accepted = open(&mut control, &meta).await;

        let mut bad = connect(h.addr).await;
        let frame = Frame::Attach(AttachRequest {
            transfer_id: accepted.transfer_id.clone(),
            resume_token: "f".repeat(32),
        });
        match roundtrip(&mut bad, frame).await {
            Frame::Error(e) => assert_eq!(e.kind, ErrorKind::Protocol),
            other => panic!("expected Error, got {other:?}"),
        }

        let mut worker = connect(h.addr).await;
        let frame = Frame::Attach(AttachRequest {
            transfer_id: accepted.transfer_id.clone(),
            resume_token: accepted.resume_token.clone(),
        });
        assert!(matches!(roundtrip(&mut worker, frame).await, Frame::AttachAck(_)));
        ack(roundtrip(&mut worker, chunk(&meta, &accepted.transfer_id, data, 2)).await);

        let frame = Frame::Status(StatusRequest {
            transfer_id: accepted.transfer_id.clone(),
        });
        match roundtrip(&mut control, frame).await {
            Frame::StatusAck(status) => {
                assert_eq!(status.completed_chunks, vec![2]);
                assert_eq!(status.total_chunks, 3);
                assert!(!status.is_completed);
            }
            other => panic!("expected StatusAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_before_hello_is_protocol_error() {
        let h = start(Duration::from_secs(5)).await;
        let data = b"abcd";
        let meta = meta(data, 4);
        let mut conn = connect(h.addr).await;
        match roundtrip(&mut conn, chunk(&meta, "t", data, 0)).await {
            Frame::Error(e) => assert_eq!(e.kind, ErrorKind::Protocol),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(read_frame(&mut conn.0, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_chunk_closes_connection() {
        let h = start(Duration::from_secs(5)).await;
        let data = vec![1u8; 2048];
        let meta = meta(&data, 1024);
        let mut conn = connect(h.addr).await;
        let id = open(&mut conn, &meta).await.transfer_id;

        // Header only: the receiver must refuse before reading any payload.
        let header = serde_json::to_vec(&ChunkMessage {
            transfer_id: id,
            chunk_index: 0,
            chunk_size: 2048,
            chunk_checksum: checksum_bytes(&data),
            is_last_chunk: true,
        })
        .unwrap();
        conn.1.write_u8(0x03).await.unwrap();
        conn.1.write_u32(header.len() as u32).await.unwrap();
        conn.1.write_all(&header).await.unwrap();

        match read_frame(&mut conn.0, 0).await.unwrap().unwrap() {
            Frame::Error(e) => assert_eq!(e.kind, ErrorKind::Protocol),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(read_frame(&mut conn.0, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_connection_keeps_progress() {
        let h = start(Duration::from_secs(5)).await;
        let data = b"0123456789";
        let meta = meta(data, 4);
        let accepted = {
            let mut conn = connect(h.addr).await;
            let accepted = open(&mut conn, &meta).await;
            ack(roundtrip(&mut conn, chunk(&meta, &accepted.transfer_id, data, 0)).await);
            conn.1.shutdown().await.unwrap();
            accepted
        };

        let mut conn = connect(h.addr).await;
        let init = TransferInit::new(&meta, Some(accepted.resume_token.clone()));
        match roundtrip(&mut conn, Frame::Init(init)).await {
            Frame::InitAck(resumed) => {
                assert_eq!(resumed.transfer_id, accepted.transfer_id);
                assert_eq!(resumed.completed_chunks, vec![0]);
            }
            other => panic!("expected InitAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let h = start(Duration::from_millis(100)).await;
        let mut conn = connect(h.addr).await;
        let result = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut conn.0, 0))
            .await
            .unwrap();
        // Server closes the idle connection without sending anything.
        assert!(matches!(result, Ok(None) | Err(DataChannelError::Io(_))));
    }

    #[tokio::test]
    async fn shutdown_stops_accept_loop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ResumeRegistry::in_memory());
        let store = Arc::new(ChunkStore::new(dir.path(), registry, 1024).unwrap());
        let receiver = FileReceiver::new(store, Duration::from_secs(5), CancellationToken::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let r = Arc::clone(&receiver);
        let task = tokio::spawn(async move { r.serve(listener).await });
        receiver.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
