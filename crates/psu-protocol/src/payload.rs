//! Typed message payloads
//!
//! [`Payload`] is a tagged union keyed by [`MessageType`]: decoding dispatches
//! exhaustively on the type byte, and every core type has exactly one payload
//! struct. Types owned by external consumers (pairing, groups, character
//! data, handshake, peer discovery) ride as [`Payload::External`] with an
//! opaque body.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use bincode::Options;
use psu_crypto::{NodeId, NodeIdentity, PUBLIC_KEY_SIZE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::message::{now_secs, ErrorCode, MessageType};
use crate::MAX_MESSAGE_SIZE;

/// Default number of nodes returned by a FindNode
pub const DEFAULT_MAX_NODES: u32 = 20;

/// Default record TTL in seconds (24 hours, also the maximum)
pub const DEFAULT_TTL_SECS: u32 = 86_400;

/// Default replication factor for stores
pub const DEFAULT_REPLICATION_FACTOR: u32 = 3;

/// Canonical description of a peer, used identically on DHT and relay paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub address: SocketAddr,
    /// Advertised services, e.g. `"relay"`, `"dht"`, `"files"`
    pub services: BTreeSet<String>,
    /// Unix seconds
    pub last_seen: u64,
    /// Reputation score in `[0, 1]`
    pub reputation: f32,
}

impl PeerInfo {
    /// Create peer info from an identity and its reachable address
    pub fn from_identity(identity: &NodeIdentity, address: SocketAddr) -> Self {
        PeerInfo {
            node_id: identity.node_id,
            public_key: identity.public_key_bytes(),
            address,
            services: BTreeSet::new(),
            last_seen: now_secs(),
            reputation: 1.0,
        }
    }

    /// Builder-style service advertisement
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.insert(service.into());
        self
    }

    pub fn offers(&self, service: &str) -> bool {
        self.services.contains(service)
    }

    /// Whether `node_id` matches the advertised public key
    pub fn id_matches_key(&self) -> bool {
        NodeIdentity::derive_node_id(&self.public_key) == self.node_id
    }
}

// DHT

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtFindNode {
    pub sender: PeerInfo,
    pub target: NodeId,
    pub max_nodes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtFindNodeResponse {
    pub sender: PeerInfo,
    /// Closest known nodes, ascending by distance to the target
    pub nodes: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtStore {
    pub sender: PeerInfo,
    pub key: String,
    pub value: Vec<u8>,
    pub ttl_secs: u32,
    pub replication_factor: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtStoreResponse {
    pub sender: PeerInfo,
    pub success: bool,
    pub error_message: Option<String>,
    pub replication_count: u32,
    /// Unix seconds at which the stored record expires
    pub expiration_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtFindValue {
    pub sender: PeerInfo,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtFindValueResponse {
    pub sender: PeerInfo,
    pub value: Option<Vec<u8>>,
    /// Closer nodes, populated when the value is not held locally
    pub nodes: Vec<PeerInfo>,
    pub expiration_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtPing {
    pub sender: PeerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtPingResponse {
    pub sender: PeerInfo,
    /// Responder load in `[0, 1]`
    pub load_factor: f32,
    pub stored_keys: u32,
}

// Relay network

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayJoin {
    pub relay: PeerInfo,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayJoinResponse {
    pub success: bool,
    pub known_relays: Vec<PeerInfo>,
    pub error_message: Option<String>,
    /// Interval the member is expected to heartbeat at
    pub heartbeat_interval_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayAnnounce {
    pub relay: PeerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHeartbeat {
    pub relay_node_id: NodeId,
    pub load: f32,
    pub connected_peers: u32,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHealthCheck {
    /// Requester clock, echoed for round-trip measurement
    pub sent_at_millis: i64,
}

/// Coarse relay health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHealthResponse {
    pub relay_node_id: NodeId,
    pub status: HealthStatus,
    /// Echo of the check's `sent_at_millis`
    pub sent_at_millis: i64,
    /// Time the relay spent producing this report
    pub response_time_ms: u32,
    pub load: f32,
    pub connected_peers: u32,
    pub metrics: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNodeList {
    pub max_relays: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNodeListResponse {
    pub relays: Vec<PeerInfo>,
}

// NAT traversal

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatProbe {
    /// Address the prober believes it has locally
    pub local_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatProbeResponse {
    /// Address the relay observed the probe arriving from
    pub observed_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatPunchRequest {
    pub target: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatPunchCoordinate {
    /// Shared by both sides of one punch
    pub session_id: [u8; 16],
    pub peer: NodeId,
    /// The other side's observed address
    pub peer_address: SocketAddr,
    /// Unix millis at which both sides start sending
    pub attempt_at_millis: i64,
    /// How long the attempt stays open
    pub window_millis: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub session_id: [u8; 16],
    pub from: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub session_id: [u8; 16],
    pub accepted: bool,
    pub reason: Option<String>,
}

// File transfer

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequest {
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequestResponse {
    pub file_hash: String,
    pub available: bool,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub error_message: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkStart {
    pub file_hash: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_hash: String,
    pub chunk_index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkAck {
    pub file_hash: String,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileComplete {
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileError {
    pub file_hash: String,
    pub code: ErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCancel {
    pub file_hash: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAvailabilityQuery {
    pub file_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAvailabilityResponse {
    pub available: Vec<String>,
}

// Error and status

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong;

/// Type-specific message body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    DhtFindNode(DhtFindNode),
    DhtFindNodeResponse(DhtFindNodeResponse),
    DhtStore(DhtStore),
    DhtStoreResponse(DhtStoreResponse),
    DhtFindValue(DhtFindValue),
    DhtFindValueResponse(DhtFindValueResponse),
    DhtPing(DhtPing),
    DhtPingResponse(DhtPingResponse),

    RelayJoin(RelayJoin),
    RelayJoinResponse(RelayJoinResponse),
    RelayAnnounce(RelayAnnounce),
    RelayHeartbeat(RelayHeartbeat),
    RelayHealthCheck(RelayHealthCheck),
    RelayHealthResponse(RelayHealthResponse),
    RelayNodeList(RelayNodeList),
    RelayNodeListResponse(RelayNodeListResponse),

    NatProbe(NatProbe),
    NatProbeResponse(NatProbeResponse),
    NatPunchRequest(NatPunchRequest),
    NatPunchCoordinate(NatPunchCoordinate),
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),

    FileRequest(FileRequest),
    FileRequestResponse(FileRequestResponse),
    FileChunkStart(FileChunkStart),
    FileChunk(FileChunk),
    FileChunkAck(FileChunkAck),
    FileComplete(FileComplete),
    FileError(FileError),
    FileCancel(FileCancel),
    FileAvailabilityQuery(FileAvailabilityQuery),
    FileAvailabilityResponse(FileAvailabilityResponse),

    Error(ErrorPayload),
    StatusUpdate(StatusUpdate),
    Ping(Ping),
    Pong(Pong),

    /// Opaque body for a non-core type
    External {
        message_type: MessageType,
        body: Vec<u8>,
    },
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE as u64)
}

fn encode_body<T: Serialize>(message_type: MessageType, value: &T) -> Result<Vec<u8>> {
    body_options()
        .serialize(value)
        .map_err(|e| ProtocolError::Serialization(format!("{:?}: {}", message_type, e)))
}

fn decode_body<T: DeserializeOwned>(message_type: MessageType, body: &[u8]) -> Result<T> {
    body_options()
        .deserialize(body)
        .map_err(|e| ProtocolError::MalformedPayload {
            message_type,
            reason: e.to_string(),
            message_id: None,
        })
}

impl Payload {
    /// Build an external payload, refusing types the engine decodes itself
    pub fn external(message_type: MessageType, body: Vec<u8>) -> Result<Self> {
        if message_type.is_core() {
            return Err(ProtocolError::Serialization(format!(
                "{:?} is a core type and cannot be sent as an external payload",
                message_type
            )));
        }
        Ok(Payload::External { message_type, body })
    }

    /// Wire discriminant for this payload
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::DhtFindNode(_) => MessageType::DhtFindNode,
            Payload::DhtFindNodeResponse(_) => MessageType::DhtFindNodeResponse,
            Payload::DhtStore(_) => MessageType::DhtStore,
            Payload::DhtStoreResponse(_) => MessageType::DhtStoreResponse,
            Payload::DhtFindValue(_) => MessageType::DhtFindValue,
            Payload::DhtFindValueResponse(_) => MessageType::DhtFindValueResponse,
            Payload::DhtPing(_) => MessageType::DhtPing,
            Payload::DhtPingResponse(_) => MessageType::DhtPingResponse,
            Payload::RelayJoin(_) => MessageType::RelayJoin,
            Payload::RelayJoinResponse(_) => MessageType::RelayJoinResponse,
            Payload::RelayAnnounce(_) => MessageType::RelayAnnounce,
            Payload::RelayHeartbeat(_) => MessageType::RelayHeartbeat,
            Payload::RelayHealthCheck(_) => MessageType::RelayHealthCheck,
            Payload::RelayHealthResponse(_) => MessageType::RelayHealthResponse,
            Payload::RelayNodeList(_) => MessageType::RelayNodeList,
            Payload::RelayNodeListResponse(_) => MessageType::RelayNodeListResponse,
            Payload::NatProbe(_) => MessageType::NatProbe,
            Payload::NatProbeResponse(_) => MessageType::NatProbeResponse,
            Payload::NatPunchRequest(_) => MessageType::NatPunchRequest,
            Payload::NatPunchCoordinate(_) => MessageType::NatPunchCoordinate,
            Payload::ConnectionRequest(_) => MessageType::ConnectionRequest,
            Payload::ConnectionResponse(_) => MessageType::ConnectionResponse,
            Payload::FileRequest(_) => MessageType::FileRequest,
            Payload::FileRequestResponse(_) => MessageType::FileRequestResponse,
            Payload::FileChunkStart(_) => MessageType::FileChunkStart,
            Payload::FileChunk(_) => MessageType::FileChunk,
            Payload::FileChunkAck(_) => MessageType::FileChunkAck,
            Payload::FileComplete(_) => MessageType::FileComplete,
            Payload::FileError(_) => MessageType::FileError,
            Payload::FileCancel(_) => MessageType::FileCancel,
            Payload::FileAvailabilityQuery(_) => MessageType::FileAvailabilityQuery,
            Payload::FileAvailabilityResponse(_) => MessageType::FileAvailabilityResponse,
            Payload::Error(_) => MessageType::Error,
            Payload::StatusUpdate(_) => MessageType::StatusUpdate,
            Payload::Ping(_) => MessageType::Ping,
            Payload::Pong(_) => MessageType::Pong,
            Payload::External { message_type, .. } => *message_type,
        }
    }

    /// Serialize the body (everything after the envelope header)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let t = self.message_type();
        match self {
            Payload::DhtFindNode(p) => encode_body(t, p),
            Payload::DhtFindNodeResponse(p) => encode_body(t, p),
            Payload::DhtStore(p) => encode_body(t, p),
            Payload::DhtStoreResponse(p) => encode_body(t, p),
            Payload::DhtFindValue(p) => encode_body(t, p),
            Payload::DhtFindValueResponse(p) => encode_body(t, p),
            Payload::DhtPing(p) => encode_body(t, p),
            Payload::DhtPingResponse(p) => encode_body(t, p),
            Payload::RelayJoin(p) => encode_body(t, p),
            Payload::RelayJoinResponse(p) => encode_body(t, p),
            Payload::RelayAnnounce(p) => encode_body(t, p),
            Payload::RelayHeartbeat(p) => encode_body(t, p),
            Payload::RelayHealthCheck(p) => encode_body(t, p),
            Payload::RelayHealthResponse(p) => encode_body(t, p),
            Payload::RelayNodeList(p) => encode_body(t, p),
            Payload::RelayNodeListResponse(p) => encode_body(t, p),
            Payload::NatProbe(p) => encode_body(t, p),
            Payload::NatProbeResponse(p) => encode_body(t, p),
            Payload::NatPunchRequest(p) => encode_body(t, p),
            Payload::NatPunchCoordinate(p) => encode_body(t, p),
            Payload::ConnectionRequest(p) => encode_body(t, p),
            Payload::ConnectionResponse(p) => encode_body(t, p),
            Payload::FileRequest(p) => encode_body(t, p),
            Payload::FileRequestResponse(p) => encode_body(t, p),
            Payload::FileChunkStart(p) => encode_body(t, p),
            Payload::FileChunk(p) => encode_body(t, p),
            Payload::FileChunkAck(p) => encode_body(t, p),
            Payload::FileComplete(p) => encode_body(t, p),
            Payload::FileError(p) => encode_body(t, p),
            Payload::FileCancel(p) => encode_body(t, p),
            Payload::FileAvailabilityQuery(p) => encode_body(t, p),
            Payload::FileAvailabilityResponse(p) => encode_body(t, p),
            Payload::Error(p) => encode_body(t, p),
            Payload::StatusUpdate(p) => encode_body(t, p),
            Payload::Ping(p) => encode_body(t, p),
            Payload::Pong(p) => encode_body(t, p),
            Payload::External { message_type, body } => {
                if message_type.is_core() {
                    return Err(ProtocolError::Serialization(format!(
                        "{:?} cannot be encoded as an external payload",
                        message_type
                    )));
                }
                Ok(body.clone())
            }
        }
    }

    /// Decode a body for the given type
    pub fn decode(message_type: MessageType, body: &[u8]) -> Result<Self> {
        use MessageType as T;
        let t = message_type;
        let payload = match message_type {
            T::DhtFindNode => Payload::DhtFindNode(decode_body(t, body)?),
            T::DhtFindNodeResponse => Payload::DhtFindNodeResponse(decode_body(t, body)?),
            T::DhtStore => Payload::DhtStore(decode_body(t, body)?),
            T::DhtStoreResponse => Payload::DhtStoreResponse(decode_body(t, body)?),
            T::DhtFindValue => Payload::DhtFindValue(decode_body(t, body)?),
            T::DhtFindValueResponse => Payload::DhtFindValueResponse(decode_body(t, body)?),
            T::DhtPing => Payload::DhtPing(decode_body(t, body)?),
            T::DhtPingResponse => Payload::DhtPingResponse(decode_body(t, body)?),

            T::RelayJoin => Payload::RelayJoin(decode_body(t, body)?),
            T::RelayJoinResponse => Payload::RelayJoinResponse(decode_body(t, body)?),
            T::RelayAnnounce => Payload::RelayAnnounce(decode_body(t, body)?),
            T::RelayHeartbeat => Payload::RelayHeartbeat(decode_body(t, body)?),
            T::RelayHealthCheck => Payload::RelayHealthCheck(decode_body(t, body)?),
            T::RelayHealthResponse => Payload::RelayHealthResponse(decode_body(t, body)?),
            T::RelayNodeList => Payload::RelayNodeList(decode_body(t, body)?),
            T::RelayNodeListResponse => Payload::RelayNodeListResponse(decode_body(t, body)?),

            T::NatProbe => Payload::NatProbe(decode_body(t, body)?),
            T::NatProbeResponse => Payload::NatProbeResponse(decode_body(t, body)?),
            T::NatPunchRequest => Payload::NatPunchRequest(decode_body(t, body)?),
            T::NatPunchCoordinate => Payload::NatPunchCoordinate(decode_body(t, body)?),
            T::ConnectionRequest => Payload::ConnectionRequest(decode_body(t, body)?),
            T::ConnectionResponse => Payload::ConnectionResponse(decode_body(t, body)?),

            T::FileRequest => Payload::FileRequest(decode_body(t, body)?),
            T::FileRequestResponse => Payload::FileRequestResponse(decode_body(t, body)?),
            T::FileChunkStart => Payload::FileChunkStart(decode_body(t, body)?),
            T::FileChunk => Payload::FileChunk(decode_body(t, body)?),
            T::FileChunkAck => Payload::FileChunkAck(decode_body(t, body)?),
            T::FileComplete => Payload::FileComplete(decode_body(t, body)?),
            T::FileError => Payload::FileError(decode_body(t, body)?),
            T::FileCancel => Payload::FileCancel(decode_body(t, body)?),
            T::FileAvailabilityQuery => Payload::FileAvailabilityQuery(decode_body(t, body)?),
            T::FileAvailabilityResponse => {
                Payload::FileAvailabilityResponse(decode_body(t, body)?)
            }

            T::Error => Payload::Error(decode_body(t, body)?),
            T::StatusUpdate => Payload::StatusUpdate(decode_body(t, body)?),
            T::Ping => Payload::Ping(decode_body(t, body)?),
            T::Pong => Payload::Pong(decode_body(t, body)?),

            T::PeerAnnounce
            | T::PeerAnnounceResponse
            | T::PeerLookup
            | T::PeerLookupResponse
            | T::PeerPresence
            | T::PeerPresenceResponse
            | T::PeerOffline
            | T::Handshake
            | T::HandshakeResponse
            | T::KeyExchange
            | T::KeyExchangeResponse
            | T::AuthChallenge
            | T::AuthChallengeResponse
            | T::UserPairRequest
            | T::UserPairResponse
            | T::UserPairAccept
            | T::UserPairReject
            | T::UserPairRemove
            | T::UserPresenceUpdate
            | T::UserPermissionUpdate
            | T::UserProfileUpdate
            | T::GroupCreate
            | T::GroupCreateResponse
            | T::GroupJoin
            | T::GroupJoinResponse
            | T::GroupLeave
            | T::GroupInvite
            | T::GroupInviteResponse
            | T::GroupMemberUpdate
            | T::GroupPermissionUpdate
            | T::GroupDelete
            | T::CharacterDataPush
            | T::CharacterDataRequest
            | T::CharacterDataResponse
            | T::CharacterDataUpdate
            | T::CharacterDataNotify
            | T::CharacterDataDelete => Payload::External {
                message_type,
                body: body.to_vec(),
            },
        };
        Ok(payload)
    }
}
