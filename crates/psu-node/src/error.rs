//! Node error types

use psu_protocol::{ErrorCode, NodeId};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while running a node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid key file: {0}")]
    KeyFile(String),

    #[error("No connection to {0}")]
    NotConnected(NodeId),

    #[error("Connection to {0} closed")]
    ConnectionClosed(SocketAddr),

    #[error("Peer answered {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(psu_protocol::MessageType),

    #[error("Crypto error: {0}")]
    Crypto(#[from] psu_crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] psu_protocol::ProtocolError),

    #[error("DHT error: {0}")]
    Dht(#[from] psu_dht::DhtError),

    #[error("Relay error: {0}")]
    Relay(#[from] psu_relay::RelayError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] psu_transfer::TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
