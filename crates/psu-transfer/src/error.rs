//! File transfer error types

use psu_protocol::{ErrorCode, MessageType};
use thiserror::Error;

/// Transfer-specific errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Integrity check failed for {file_hash}: content hashes to {actual}")]
    Integrity { file_hash: String, actual: String },

    #[error("Chunk {index} out of range for {file_hash} ({total} chunks)")]
    ChunkOutOfRange {
        file_hash: String,
        index: u32,
        total: u32,
    },

    #[error("Chunk {index} of {file_hash} has {actual} bytes, expected {expected}")]
    ChunkLength {
        file_hash: String,
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid transfer header for {file_hash}: {reason}")]
    InvalidHeader { file_hash: String, reason: String },

    #[error("Transfer of {file_hash} incomplete: {missing} chunks missing")]
    Incomplete { file_hash: String, missing: u32 },

    #[error("Invalid transfer transition: {event} while {state}")]
    InvalidState {
        state: &'static str,
        event: &'static str,
    },

    #[error("No transfer session for {0}")]
    SessionNotFound(String),

    #[error("Transfer of {0} already in progress")]
    SessionExists(String),

    #[error("Too many concurrent transfers (max {0})")]
    TooManySessions(usize),

    #[error("File {0} not available")]
    FileNotFound(String),

    #[error("Chunk {chunk_index} of {file_hash} unacknowledged after {attempts} attempts")]
    RetriesExhausted {
        file_hash: String,
        chunk_index: u32,
        attempts: u32,
    },

    #[error("Peer reported {code:?} for {file_hash}: {reason}")]
    Remote {
        file_hash: String,
        code: ErrorCode,
        reason: String,
    },

    #[error("Unexpected message type: {0:?}")]
    UnexpectedMessage(MessageType),

    #[error("Protocol error: {0}")]
    Protocol(#[from] psu_protocol::ProtocolError),
}

impl TransferError {
    /// Whether the session cannot continue and must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::Integrity { .. }
                | TransferError::RetriesExhausted { .. }
                | TransferError::Remote { .. }
        )
    }

    /// File the error concerns, when it belongs to a session
    pub fn file_hash(&self) -> Option<&str> {
        match self {
            TransferError::Integrity { file_hash, .. }
            | TransferError::ChunkOutOfRange { file_hash, .. }
            | TransferError::ChunkLength { file_hash, .. }
            | TransferError::InvalidHeader { file_hash, .. }
            | TransferError::Incomplete { file_hash, .. }
            | TransferError::RetriesExhausted { file_hash, .. }
            | TransferError::Remote { file_hash, .. } => Some(file_hash),
            TransferError::SessionNotFound(file_hash)
            | TransferError::SessionExists(file_hash)
            | TransferError::FileNotFound(file_hash) => Some(file_hash),
            _ => None,
        }
    }

    /// Wire error code reported to the remote side
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransferError::Integrity { .. }
            | TransferError::ChunkOutOfRange { .. }
            | TransferError::ChunkLength { .. }
            | TransferError::InvalidHeader { .. }
            | TransferError::Incomplete { .. } => ErrorCode::InvalidData,
            TransferError::SessionNotFound(_) | TransferError::FileNotFound(_) => {
                ErrorCode::NotFound
            }
            TransferError::TooManySessions(_) => ErrorCode::Overloaded,
            TransferError::RetriesExhausted { .. } => ErrorCode::PeerUnreachable,
            TransferError::Remote { code, .. } => *code,
            TransferError::UnexpectedMessage(_) | TransferError::Protocol(_) => {
                ErrorCode::MalformedPayload
            }
            TransferError::InvalidState { .. } | TransferError::SessionExists(_) => {
                ErrorCode::PeerRejected
            }
        }
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;
