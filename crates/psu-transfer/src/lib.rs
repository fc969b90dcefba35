//! PocketSizedUniverse file transfer
//!
//! Content-addressed, chunked transfers between two peers. The receiver
//! acknowledges every chunk and verifies the SHA-256 of the assembled
//! content before accepting completion; the sender retransmits
//! unacknowledged chunks with exponential backoff.

pub mod error;
pub mod manager;
pub mod sender;
pub mod session;

pub use error::{Result, TransferError};
pub use manager::{TransferConfig, TransferEvent, TransferManager, TransferReply};
pub use sender::{OutgoingTransfer, RetryPolicy, SenderState};
pub use session::{chunk_count, FileTransferSession, TransferState};

/// Default chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
