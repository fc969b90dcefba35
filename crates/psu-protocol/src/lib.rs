//! PocketSizedUniverse wire protocol
//!
//! This crate defines the authenticated message envelope shared by every
//! component of the network:
//! - Message types and typed payloads
//! - Canonical serialization and length-prefixed framing
//! - Ed25519 message signing and verification
//! - Request/response correlation with bounded waits

pub mod codec;
pub mod correlation;
pub mod error;
pub mod message;
pub mod payload;
pub mod signing;

pub use codec::{
    decode_frame, deserialize_message, encode_frame, read_frame, serialize_message, write_frame,
    LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use correlation::{PendingRequests, ResponseHandle};
pub use error::{ProtocolError, Result};
pub use message::{
    now_millis, now_secs, ErrorCode, Message, MessageCategory, MessageType, PROTOCOL_VERSION,
};
pub use payload::{Payload, PeerInfo};
pub use psu_crypto::NodeId;
pub use signing::{sign_message, verify_message};
