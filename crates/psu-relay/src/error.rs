//! Relay and NAT coordination error types

use psu_protocol::{ErrorCode, MessageType, NodeId};
use thiserror::Error;

/// Relay-specific errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid membership transition: {event} while {state}")]
    InvalidState {
        state: &'static str,
        event: &'static str,
    },

    #[error("Join rejected by relay: {0}")]
    JoinRejected(String),

    #[error("Evicted after {missed} unacknowledged heartbeats")]
    Evicted { missed: u32 },

    #[error("Unknown relay member: {0}")]
    UnknownMember(NodeId),

    #[error("Relay registry full (max {0} members)")]
    RegistryFull(usize),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Peer unreachable: {0} has not probed this relay")]
    PeerUnreachable(NodeId),

    #[error("Invalid punch request: {0}")]
    InvalidPunchRequest(String),

    #[error("Relay request timed out")]
    Timeout,

    #[error("Unexpected message type: {0:?}")]
    UnexpectedMessage(MessageType),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] psu_protocol::ProtocolError),
}

impl RelayError {
    /// Wire error code reported to the remote side
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RelayError::PeerUnreachable(_) => ErrorCode::PeerUnreachable,
            RelayError::JoinRejected(_) | RelayError::UnsupportedVersion(_) => {
                ErrorCode::PeerRejected
            }
            RelayError::UnknownMember(_) => ErrorCode::NotFound,
            RelayError::RegistryFull(_) => ErrorCode::Overloaded,
            RelayError::InvalidPunchRequest(_) => ErrorCode::InvalidData,
            RelayError::UnexpectedMessage(_) | RelayError::Protocol(_) => {
                ErrorCode::MalformedPayload
            }
            _ => ErrorCode::Internal,
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
