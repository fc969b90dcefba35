//! Message types and the signed message envelope
//!
//! Every message on the wire carries a single-byte [`MessageType`] whose
//! numeric ranges group related functionality:
//!
//! | Range   | Purpose                          |
//! |---------|----------------------------------|
//! | 0-19    | DHT operations                   |
//! | 20-39   | Relay network management         |
//! | 40-59   | Peer discovery (external)        |
//! | 60-79   | NAT traversal and connection     |
//! | 80-99   | Handshake (external)             |
//! | 100-119 | File transfer                    |
//! | 120-139 | User pairing (external)          |
//! | 140-159 | Groups (external)                |
//! | 160-179 | Character data (external)        |
//! | 240-255 | Error and status                 |

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use psu_crypto::{NodeId, NodeIdentity, Signature, PUBLIC_KEY_SIZE};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::payload::Payload;

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Wire discriminant of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // DHT
    DhtFindNode = 0,
    DhtFindNodeResponse = 1,
    DhtStore = 2,
    DhtStoreResponse = 3,
    DhtFindValue = 4,
    DhtFindValueResponse = 5,
    DhtPing = 6,
    DhtPingResponse = 7,

    // Relay network
    RelayJoin = 20,
    RelayJoinResponse = 21,
    RelayAnnounce = 22,
    RelayHeartbeat = 23,
    RelayHealthCheck = 24,
    RelayHealthResponse = 25,
    RelayNodeList = 26,
    RelayNodeListResponse = 27,

    // Peer discovery
    PeerAnnounce = 40,
    PeerAnnounceResponse = 41,
    PeerLookup = 42,
    PeerLookupResponse = 43,
    PeerPresence = 44,
    PeerPresenceResponse = 45,
    PeerOffline = 46,

    // NAT traversal
    NatProbe = 60,
    NatProbeResponse = 61,
    NatPunchRequest = 62,
    NatPunchCoordinate = 63,
    ConnectionRequest = 64,
    ConnectionResponse = 65,

    // Handshake
    Handshake = 80,
    HandshakeResponse = 81,
    KeyExchange = 82,
    KeyExchangeResponse = 83,
    AuthChallenge = 84,
    AuthChallengeResponse = 85,

    // File transfer
    FileRequest = 100,
    FileRequestResponse = 101,
    FileChunkStart = 102,
    FileChunk = 103,
    FileChunkAck = 104,
    FileComplete = 105,
    FileError = 106,
    FileCancel = 107,
    FileAvailabilityQuery = 108,
    FileAvailabilityResponse = 109,

    // User pairing
    UserPairRequest = 120,
    UserPairResponse = 121,
    UserPairAccept = 122,
    UserPairReject = 123,
    UserPairRemove = 124,
    UserPresenceUpdate = 125,
    UserPermissionUpdate = 126,
    UserProfileUpdate = 127,

    // Groups
    GroupCreate = 140,
    GroupCreateResponse = 141,
    GroupJoin = 142,
    GroupJoinResponse = 143,
    GroupLeave = 144,
    GroupInvite = 145,
    GroupInviteResponse = 146,
    GroupMemberUpdate = 147,
    GroupPermissionUpdate = 148,
    GroupDelete = 149,

    // Character data
    CharacterDataPush = 160,
    CharacterDataRequest = 161,
    CharacterDataResponse = 162,
    CharacterDataUpdate = 163,
    CharacterDataNotify = 164,
    CharacterDataDelete = 165,

    // Error and status
    Error = 240,
    StatusUpdate = 241,
    Ping = 254,
    Pong = 255,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        use MessageType::*;
        let message_type = match value {
            0 => DhtFindNode,
            1 => DhtFindNodeResponse,
            2 => DhtStore,
            3 => DhtStoreResponse,
            4 => DhtFindValue,
            5 => DhtFindValueResponse,
            6 => DhtPing,
            7 => DhtPingResponse,
            20 => RelayJoin,
            21 => RelayJoinResponse,
            22 => RelayAnnounce,
            23 => RelayHeartbeat,
            24 => RelayHealthCheck,
            25 => RelayHealthResponse,
            26 => RelayNodeList,
            27 => RelayNodeListResponse,
            40 => PeerAnnounce,
            41 => PeerAnnounceResponse,
            42 => PeerLookup,
            43 => PeerLookupResponse,
            44 => PeerPresence,
            45 => PeerPresenceResponse,
            46 => PeerOffline,
            60 => NatProbe,
            61 => NatProbeResponse,
            62 => NatPunchRequest,
            63 => NatPunchCoordinate,
            64 => ConnectionRequest,
            65 => ConnectionResponse,
            80 => Handshake,
            81 => HandshakeResponse,
            82 => KeyExchange,
            83 => KeyExchangeResponse,
            84 => AuthChallenge,
            85 => AuthChallengeResponse,
            100 => FileRequest,
            101 => FileRequestResponse,
            102 => FileChunkStart,
            103 => FileChunk,
            104 => FileChunkAck,
            105 => FileComplete,
            106 => FileError,
            107 => FileCancel,
            108 => FileAvailabilityQuery,
            109 => FileAvailabilityResponse,
            120 => UserPairRequest,
            121 => UserPairResponse,
            122 => UserPairAccept,
            123 => UserPairReject,
            124 => UserPairRemove,
            125 => UserPresenceUpdate,
            126 => UserPermissionUpdate,
            127 => UserProfileUpdate,
            140 => GroupCreate,
            141 => GroupCreateResponse,
            142 => GroupJoin,
            143 => GroupJoinResponse,
            144 => GroupLeave,
            145 => GroupInvite,
            146 => GroupInviteResponse,
            147 => GroupMemberUpdate,
            148 => GroupPermissionUpdate,
            149 => GroupDelete,
            160 => CharacterDataPush,
            161 => CharacterDataRequest,
            162 => CharacterDataResponse,
            163 => CharacterDataUpdate,
            164 => CharacterDataNotify,
            165 => CharacterDataDelete,
            240 => Error,
            241 => StatusUpdate,
            254 => Ping,
            255 => Pong,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message_type)
    }
}

/// Functional group a message type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    Dht,
    Relay,
    PeerDiscovery,
    Nat,
    Handshake,
    FileTransfer,
    User,
    Group,
    CharacterData,
    Status,
}

impl MessageType {
    /// Wire byte for this type
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Range this type falls in
    pub fn category(self) -> MessageCategory {
        match self as u8 {
            0..=19 => MessageCategory::Dht,
            20..=39 => MessageCategory::Relay,
            40..=59 => MessageCategory::PeerDiscovery,
            60..=79 => MessageCategory::Nat,
            80..=99 => MessageCategory::Handshake,
            100..=119 => MessageCategory::FileTransfer,
            120..=139 => MessageCategory::User,
            140..=159 => MessageCategory::Group,
            160..=179 => MessageCategory::CharacterData,
            _ => MessageCategory::Status,
        }
    }

    /// Whether the protocol engine understands this type's payload
    ///
    /// Non-core types are carried as opaque bodies for external consumers.
    pub fn is_core(self) -> bool {
        matches!(
            self.category(),
            MessageCategory::Dht
                | MessageCategory::Relay
                | MessageCategory::Nat
                | MessageCategory::FileTransfer
                | MessageCategory::Status
        )
    }
}

/// Error codes carried by `Error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Payload failed to decode or was not valid for its type
    MalformedPayload,
    /// Signature missing or invalid
    AuthenticationFailed,
    /// Target peer cannot be reached (e.g. never probed the relay)
    PeerUnreachable,
    /// Target peer refused the request
    PeerRejected,
    /// Data failed validation (size, range, integrity)
    InvalidData,
    /// Requested item does not exist
    NotFound,
    /// Responder is at capacity
    Overloaded,
    /// Unexpected internal failure
    Internal,
}

/// Protocol message envelope
///
/// The signature covers the canonical serialization of every other field,
/// so any mutation after signing invalidates it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: u8,
    pub message_id: Uuid,
    /// Creation time, unix milliseconds
    pub timestamp_millis: i64,
    pub sender_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    pub signature: Option<Signature>,
    /// Message id of the request this message answers
    pub correlation_id: Option<Uuid>,
    pub payload: Payload,
}

impl Message {
    /// Create a new unsigned message with a fresh id and timestamp
    pub fn new(payload: Payload) -> Self {
        Message {
            version: PROTOCOL_VERSION,
            message_id: Uuid::new_v4(),
            timestamp_millis: now_millis(),
            sender_public_key: None,
            signature: None,
            correlation_id: None,
            payload,
        }
    }

    /// Type discriminant, derived from the payload
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Build an unsigned response correlated with this message
    pub fn create_response(&self, payload: Payload) -> Message {
        Message {
            version: self.version,
            ..Message::response_to(self.message_id, payload)
        }
    }

    /// Build an unsigned response to a request known only by its id
    pub fn response_to(request_id: Uuid, payload: Payload) -> Message {
        Message {
            correlation_id: Some(request_id),
            ..Message::new(payload)
        }
    }

    /// Sign in place with the given identity
    pub fn sign(&mut self, identity: &NodeIdentity) -> crate::Result<()> {
        crate::signing::sign_message(self, identity)
    }

    /// Sign and return self
    pub fn signed(mut self, identity: &NodeIdentity) -> crate::Result<Self> {
        self.sign(identity)?;
        Ok(self)
    }

    /// Whether `ttl` has elapsed since the message was created
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(ttl, now_millis())
    }

    /// Expiry check against an explicit clock
    pub fn is_expired_at(&self, ttl: Duration, now_millis: i64) -> bool {
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        now_millis > self.timestamp_millis.saturating_add(ttl_millis)
    }

    /// Node id derived from the sender's public key, if present
    pub fn sender_node_id(&self) -> Option<NodeId> {
        self.sender_public_key
            .as_ref()
            .map(|key| NodeIdentity::derive_node_id(key))
    }
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ErrorPayload, Ping};

    #[test]
    fn test_message_type_round_trip_all_codes() {
        for byte in 0..=u8::MAX {
            if let Ok(message_type) = MessageType::try_from(byte) {
                assert_eq!(message_type.as_u8(), byte);
            }
        }
    }

    #[test]
    fn test_unassigned_codes_rejected() {
        for byte in [8u8, 19, 28, 47, 66, 86, 110, 128, 150, 166, 200, 242, 253] {
            assert!(matches!(
                MessageType::try_from(byte),
                Err(ProtocolError::UnknownMessageType(b)) if b == byte
            ));
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(MessageType::DhtPing.category(), MessageCategory::Dht);
        assert_eq!(MessageType::RelayNodeList.category(), MessageCategory::Relay);
        assert_eq!(MessageType::NatPunchCoordinate.category(), MessageCategory::Nat);
        assert_eq!(
            MessageType::FileAvailabilityResponse.category(),
            MessageCategory::FileTransfer
        );
        assert_eq!(MessageType::Pong.category(), MessageCategory::Status);

        assert!(MessageType::FileChunk.is_core());
        assert!(MessageType::Error.is_core());
        assert!(!MessageType::GroupCreate.is_core());
        assert!(!MessageType::Handshake.is_core());
        assert!(!MessageType::CharacterDataPush.is_core());
    }

    #[test]
    fn test_create_response() {
        let request = Message::new(Payload::Ping(Ping));
        let response = request.create_response(Payload::Error(ErrorPayload {
            code: ErrorCode::NotFound,
            message: "nope".to_string(),
        }));

        assert_eq!(response.correlation_id, Some(request.message_id));
        assert_eq!(response.version, request.version);
        assert_ne!(response.message_id, request.message_id);
        assert!(response.signature.is_none());
        assert!(response.sender_public_key.is_none());
    }

    #[test]
    fn test_is_expired_at() {
        let mut message = Message::new(Payload::Ping(Ping));
        message.timestamp_millis = 1_000;
        let ttl = Duration::from_secs(5);

        assert!(!message.is_expired_at(ttl, 1_000));
        assert!(!message.is_expired_at(ttl, 6_000));
        assert!(message.is_expired_at(ttl, 6_001));
    }

    #[test]
    fn test_fresh_message_not_expired() {
        let message = Message::new(Payload::Ping(Ping));
        assert!(!message.is_expired(Duration::from_secs(60)));
    }
}
