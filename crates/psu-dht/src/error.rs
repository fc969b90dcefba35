//! DHT error types

use psu_protocol::{ErrorCode, MessageType};
use thiserror::Error;

/// DHT-specific errors
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage full (max {max} bytes)")]
    StorageFull { max: usize },

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Too many keys (max {0})")]
    TooManyKeys(usize),

    #[error("Invalid replication factor: {0} (must be at least 1)")]
    InvalidReplicationFactor(u32),

    #[error("Store was not acknowledged by any of {attempted} nodes")]
    StoreFailed { attempted: usize },

    #[error("Query timeout")]
    QueryTimeout,

    #[error("No known nodes in routing table")]
    NoKnownNodes,

    #[error("Peer rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected message type: {0:?}")]
    UnexpectedMessage(MessageType),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] psu_protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] psu_crypto::CryptoError),
}

impl DhtError {
    /// Whether a retry against the same or another node may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DhtError::QueryTimeout | DhtError::Transport(_) | DhtError::StoreFailed { .. }
        )
    }

    /// Wire error code reported to a requester
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DhtError::KeyNotFound => ErrorCode::NotFound,
            DhtError::InvalidKey(_)
            | DhtError::ValueTooLarge { .. }
            | DhtError::InvalidReplicationFactor(_) => ErrorCode::InvalidData,
            DhtError::StorageFull { .. } | DhtError::TooManyKeys(_) => ErrorCode::Overloaded,
            DhtError::Rejected(_) => ErrorCode::PeerRejected,
            DhtError::QueryTimeout
            | DhtError::NoKnownNodes
            | DhtError::StoreFailed { .. }
            | DhtError::Transport(_) => ErrorCode::PeerUnreachable,
            DhtError::UnexpectedMessage(_) | DhtError::Protocol(_) => ErrorCode::MalformedPayload,
            DhtError::Crypto(_) => ErrorCode::AuthenticationFailed,
        }
    }
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;
