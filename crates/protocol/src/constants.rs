use std::time::Duration;

/// Protocol version sent in every [`TransferInit`](crate::TransferInit).
pub const PROTOCOL_VERSION: u32 = 1;

/// Default chunk size (50 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Default number of chunk sends allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 4;

/// Largest JSON header a frame may carry (64 KiB).
pub const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Timeout for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single read or write on an established connection.
///
/// Generous enough to move one default-sized chunk over a slow link.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Frame kind byte at the start of every frame on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    // Client -> receiver
    Init = 0x01,
    Attach = 0x02,
    Chunk = 0x03,
    Finalize = 0x04,
    Status = 0x05,

    // Receiver -> client
    InitAck = 0x81,
    AttachAck = 0x82,
    ChunkAck = 0x83,
    Finalized = 0x84,
    StatusAck = 0x85,
    Error = 0xFF,
}

/// Returned when a frame kind byte is not recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown frame kind: {0:#04x}")]
pub struct UnknownFrameKind(pub u8);

impl TryFrom<u8> for FrameKind {
    type Error = UnknownFrameKind;

    fn try_from(value: u8) -> Result<Self, UnknownFrameKind> {
        Ok(match value {
            0x01 => FrameKind::Init,
            0x02 => FrameKind::Attach,
            0x03 => FrameKind::Chunk,
            0x04 => FrameKind::Finalize,
            0x05 => FrameKind::Status,
            0x81 => FrameKind::InitAck,
            0x82 => FrameKind::AttachAck,
            0x83 => FrameKind::ChunkAck,
            0x84 => FrameKind::Finalized,
            0x85 => FrameKind::StatusAck,
            0xFF => FrameKind::Error,
            other => return Err(UnknownFrameKind(other)),
        })
    }
}

impl FrameKind {
    /// Whether frames of this kind carry a binary payload after the header.
    pub fn has_payload(self) -> bool {
        matches!(self, FrameKind::Chunk)
    }
}
