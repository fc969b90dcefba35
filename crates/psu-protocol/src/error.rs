//! Protocol error types

use thiserror::Error;
use uuid::Uuid;

use crate::message::MessageType;

/// Errors raised by the envelope codec, signing layer and request correlation
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Declared frame length is `<= 0` or larger than the maximum message size
    #[error("Invalid message length: {length} (max {max})")]
    OversizedMessage { length: i64, max: usize },

    /// The peer closed the stream before a full frame was read
    #[error("Connection closed while reading frame")]
    ConnectionClosed,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// The body did not decode; `message_id` is set when the header did
    #[error("Malformed {message_type:?} payload: {reason}")]
    MalformedPayload {
        message_type: MessageType,
        reason: String,
        message_id: Option<Uuid>,
    },

    #[error("Invalid message header: {0}")]
    InvalidHeader(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Request cancelled")]
    RequestCancelled,

    #[error("Too many pending requests (max {0})")]
    TooManyPendingRequests(usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] psu_crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error means the underlying connection is unusable
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            ProtocolError::OversizedMessage { .. }
                | ProtocolError::ConnectionClosed
                | ProtocolError::Io(_)
        )
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
