//! TCP data channel for chunked backup transfers.
//!
//! The [`server::FileReceiver`] accepts any number of connections and hands
//! chunks to a [`ChunkStore`](dbshuttle_transfer::ChunkStore). The
//! [`client::TransferClient`] splits a local archive into chunks and streams
//! them over up to `max_concurrent_chunks` connections, resuming from the
//! receiver's record after an interruption.
//!
//! # Wire format
//!
//! See [`wire`] module for the frame layout.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::{CompletedTransfer, RetryPolicy, TransferClient, TransferConfig, TransferHandle};
pub use error::{DataChannelError, TransferFailed};
pub use server::FileReceiver;
pub use wire::Frame;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;
