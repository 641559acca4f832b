//! TCP wire format for chunked transfers.
//!
//! # Wire format
//!
//! ```text
//! FRAME:
//!   [1 byte: frame kind]
//!   [4 bytes BE: header_len]
//!   [header_len bytes: JSON header, camelCase]
//!   [Chunk frames only: chunkSize bytes of payload]
//!
//! CLIENT -> RECEIVER:
//!   0x01 Init       TransferInit       first frame of a control connection
//!   0x02 Attach     AttachRequest      first frame of a worker connection
//!   0x03 Chunk      ChunkMessage + payload
//!   0x04 Finalize   FinalizeRequest
//!   0x05 Status     StatusRequest
//!
//! RECEIVER -> CLIENT:
//!   0x81 InitAck    TransferAccepted
//!   0x82 AttachAck  AttachAccepted
//!   0x83 ChunkAck   ChunkResponse
//!   0x84 Finalized  FinalizeResponse   also sent unprompted after the ack
//!                                      that completes the transfer
//!   0x85 StatusAck  TransferStatus
//!   0xFF Error      ErrorResponse
//! ```

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use dbshuttle_protocol::constants::MAX_HEADER_LEN;
use dbshuttle_protocol::{
    AttachAccepted, AttachRequest, ChunkMessage, ChunkResponse, ErrorResponse, FinalizeRequest,
    FinalizeResponse, FrameKind, StatusRequest, TransferAccepted, TransferInit, TransferStatus,
};

use crate::error::DataChannelError;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Init(TransferInit),
    Attach(AttachRequest),
    Chunk(ChunkMessage, Vec<u8>),
    Finalize(FinalizeRequest),
    Status(StatusRequest),
    InitAck(TransferAccepted),
    AttachAck(AttachAccepted),
    ChunkAck(ChunkResponse),
    Finalized(FinalizeResponse),
    StatusAck(TransferStatus),
    Error(ErrorResponse),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Init(_) => FrameKind::Init,
            Frame::Attach(_) => FrameKind::Attach,
            Frame::Chunk(..) => FrameKind::Chunk,
            Frame::Finalize(_) => FrameKind::Finalize,
            Frame::Status(_) => FrameKind::Status,
            Frame::InitAck(_) => FrameKind::InitAck,
            Frame::AttachAck(_) => FrameKind::AttachAck,
            Frame::ChunkAck(_) => FrameKind::ChunkAck,
            Frame::Finalized(_) => FrameKind::Finalized,
            Frame::StatusAck(_) => FrameKind::StatusAck,
            Frame::Error(_) => FrameKind::Error,
        }
    }

    fn header_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Frame::Init(h) => serde_json::to_vec(h),
            Frame::Attach(h) => serde_json::to_vec(h),
            Frame::Chunk(h, _) => serde_json::to_vec(h),
            Frame::Finalize(h) => serde_json::to_vec(h),
            Frame::Status(h) => serde_json::to_vec(h),
            Frame::InitAck(h) => serde_json::to_vec(h),
            Frame::AttachAck(h) => serde_json::to_vec(h),
            Frame::ChunkAck(h) => serde_json::to_vec(h),
            Frame::Finalized(h) => serde_json::to_vec(h),
            Frame::StatusAck(h) => serde_json::to_vec(h),
            Frame::Error(h) => serde_json::to_vec(h),
        }
    }
}

/// Writes one frame and flushes the writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), DataChannelError> {
    let header = frame.header_json()?;
    if header.len() > MAX_HEADER_LEN as usize {
        return Err(DataChannelError::Protocol(format!(
            "header too large: {} bytes (max {MAX_HEADER_LEN})",
            header.len()
        )));
    }
    if let Frame::Chunk(msg, payload) = frame {
        if payload.len() as u64 != msg.chunk_size {
            return Err(DataChannelError::Protocol(format!(
                "chunk {} payload is {} bytes, header says {}",
                msg.chunk_index,
                payload.len(),
                msg.chunk_size
            )));
        }
    }

    writer.write_u8(frame.kind() as u8).await?;
    writer.write_u32(header.len() as u32).await?;
    writer.write_all(&header).await?;
    if let Frame::Chunk(_, payload) = frame {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `None` on a clean EOF before the kind byte. Chunk payloads larger
/// than `max_payload` are rejected before any payload byte is read.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u64,
) -> Result<Option<Frame>, DataChannelError> {
    let kind_byte = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let kind = FrameKind::try_from(kind_byte)
        .map_err(|e| DataChannelError::Protocol(e.to_string()))?;

    let header_len = reader.read_u32().await?;
    if header_len > MAX_HEADER_LEN {
        return Err(DataChannelError::Protocol(format!(
            "header too large: {header_len} bytes (max {MAX_HEADER_LEN})"
        )));
    }
    let mut header = vec![0u8; header_len as usize];
    reader.read_exact(&mut header).await?;

    let frame = match kind {
        FrameKind::Init => Frame::Init(parse(&header)?),
        FrameKind::Attach => Frame::Attach(parse(&header)?),
        FrameKind::Chunk => {
            let msg: ChunkMessage = parse(&header)?;
            if msg.chunk_size > max_payload {
                return Err(DataChannelError::Protocol(format!(
                    "chunk {} payload of {} bytes exceeds limit {max_payload}",
                    msg.chunk_index, msg.chunk_size
                )));
            }
            let mut payload = vec![0u8; msg.chunk_size as usize];
            reader.read_exact(&mut payload).await?;
            Frame::Chunk(msg, payload)
        }
        FrameKind::Finalize => Frame::Finalize(parse(&header)?),
        FrameKind::Status => Frame::Status(parse(&header)?),
        FrameKind::InitAck => Frame::InitAck(parse(&header)?),
        FrameKind::AttachAck => Frame::AttachAck(parse(&header)?),
        FrameKind::ChunkAck => Frame::ChunkAck(parse(&header)?),
        FrameKind::Finalized => Frame::Finalized(parse(&header)?),
        FrameKind::StatusAck => Frame::StatusAck(parse(&header)?),
        FrameKind::Error => Frame::Error(parse(&header)?),
    };
    Ok(Some(frame))
}

fn parse<T: DeserializeOwned>(header: &[u8]) -> Result<T, DataChannelError> {
    Ok(serde_json::from_slice(header)?)
}
