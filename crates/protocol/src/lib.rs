//! Wire protocol types for the dbshuttle backup transfer.
//!
//! The types here are shared by the transfer client and the file receiver.
//! Framing (how headers and payloads are laid out on the TCP stream) lives in
//! `dbshuttle-data-channel`; this crate only defines what is carried.

pub mod constants;
pub mod messages;
pub mod types;

pub use constants::{FrameKind, PROTOCOL_VERSION};
pub use messages::{
    AttachAccepted, AttachRequest, ChunkMessage, ChunkResponse, ErrorResponse, FinalizeRequest,
    FinalizeResponse, StatusRequest, TransferAccepted, TransferInit, TransferStatus,
};
pub use types::{ErrorKind, FileMetadata};
