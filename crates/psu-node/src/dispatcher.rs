//! Inbound message pipeline
//!
//! Every decoded envelope passes through [`Dispatcher::dispatch`]:
//! 1. The signature is verified; failures are dropped and logged.
//! 2. Expired messages and foreign protocol versions are refused.
//! 3. Responses complete their pending request, late ones are dropped.
//! 4. Requests are routed by type to the DHT, relay, hole punch or transfer
//!    component, and failures become `Error` or `FileError` replies.

use psu_dht::DhtService;
use psu_protocol::payload::{ErrorPayload, FileError, NatPunchCoordinate, Pong};
use psu_protocol::{
    verify_message, ErrorCode, Message, MessageCategory, MessageType, NodeId, Payload,
    PendingRequests,
};
use psu_relay::{HolePuncher, PunchOutcome, RelayService};
use psu_transfer::{TransferError, TransferEvent, TransferManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What handling one inbound message produced
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Verified sender, when the message was authentic
    pub sender: Option<NodeId>,
    /// Replies for the sender, unsigned
    pub replies: Vec<Message>,
    /// Messages for other connected peers, unsigned
    pub forwards: Vec<(NodeId, Message)>,
    /// Transfers that finished
    pub events: Vec<TransferEvent>,
}

impl Dispatch {
    fn from(sender: NodeId) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    fn reply(mut self, message: Message) -> Self {
        self.replies.push(message);
        self
    }
}

/// Types that only ever answer a request
fn is_response(payload: &Payload) -> bool {
    matches!(
        payload,
        Payload::DhtFindNodeResponse(_)
            | Payload::DhtStoreResponse(_)
            | Payload::DhtFindValueResponse(_)
            | Payload::DhtPingResponse(_)
            | Payload::RelayJoinResponse(_)
            | Payload::RelayHealthResponse(_)
            | Payload::RelayNodeListResponse(_)
            | Payload::NatProbeResponse(_)
            | Payload::ConnectionResponse(_)
            | Payload::Error(_)
            | Payload::Pong(_)
    )
}

/// Error reply correlated with `request`
pub fn error_reply(request: &Message, code: ErrorCode, message: impl Into<String>) -> Message {
    request.create_response(Payload::Error(ErrorPayload {
        code,
        message: message.into(),
    }))
}

/// `Error(MalformedPayload)` for a message whose body did not decode
///
/// Nothing is sent back for a malformed `Error`, so two nodes cannot bounce
/// errors at each other.
pub fn malformed_reply(message_type: MessageType, request_id: Uuid, reason: &str) -> Option<Message> {
    if message_type == MessageType::Error {
        return None;
    }
    Some(Message::response_to(
        request_id,
        Payload::Error(ErrorPayload {
            code: ErrorCode::MalformedPayload,
            message: format!("malformed {:?} payload: {}", message_type, reason),
        }),
    ))
}

/// Routes verified messages to the node's components
pub struct Dispatcher {
    protocol_version: u8,
    message_ttl: Duration,
    pending: PendingRequests,
    dht: Arc<DhtService>,
    /// Present when this node offers relay service
    relay: Option<Arc<RelayService>>,
    puncher: Arc<HolePuncher>,
    transfers: Arc<TransferManager>,
}

impl Dispatcher {
    pub fn new(
        protocol_version: u8,
        message_ttl: Duration,
        pending: PendingRequests,
        dht: Arc<DhtService>,
        relay: Option<Arc<RelayService>>,
        puncher: Arc<HolePuncher>,
        transfers: Arc<TransferManager>,
    ) -> Self {
        Self {
            protocol_version,
            message_ttl,
            pending,
            dht,
            relay,
            puncher,
            transfers,
        }
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Handle one message received from `observed_address`
    pub async fn dispatch(&self, message: Message, observed_address: SocketAddr) -> Dispatch {
        let sender = match message.sender_node_id() {
            Some(sender) if verify_message(&message) => sender,
            _ => {
                warn!(
                    "Dropping {:?} {} from {}: invalid or missing signature",
                    message.message_type(),
                    message.message_id,
                    observed_address
                );
                return Dispatch::default();
            }
        };

        if message.is_expired(self.message_ttl) {
            debug!("Dropping expired {:?} from {}", message.message_type(), sender);
            return Dispatch::from(sender);
        }
        if message.version != self.protocol_version {
            warn!(
                "Refusing protocol version {} from {} (speaking {})",
                message.version, sender, self.protocol_version
            );
            let reply = error_reply(
                &message,
                ErrorCode::PeerRejected,
                format!("unsupported protocol version {}", message.version),
            );
            return Dispatch::from(sender).reply(reply);
        }

        let message = if message.correlation_id.is_some() {
            match self.pending.complete(message).await {
                Ok(()) => return Dispatch::from(sender),
                Err(unmatched) => unmatched,
            }
        } else {
            message
        };
        if is_response(&message.payload)
            || (message.correlation_id.is_some()
                && matches!(
                    message.payload,
                    Payload::RelayHeartbeat(_) | Payload::NatPunchCoordinate(_)
                ))
        {
            debug!(
                "Dropping unsolicited {:?} from {}",
                message.message_type(),
                sender
            );
            return Dispatch::from(sender);
        }

        match message.message_type().category() {
            MessageCategory::Dht => self.dispatch_dht(sender, message).await,
            MessageCategory::Relay => self.dispatch_relay(sender, observed_address, message).await,
            MessageCategory::Nat => self.dispatch_nat(sender, observed_address, message).await,
            MessageCategory::FileTransfer => self.dispatch_transfer(sender, message).await,
            _ => self.dispatch_other(sender, message),
        }
    }

    async fn dispatch_dht(&self, sender: NodeId, message: Message) -> Dispatch {
        let claimed = match &message.payload {
            Payload::DhtFindNode(req) => Some(&req.sender),
            Payload::DhtFindValue(req) => Some(&req.sender),
            Payload::DhtStore(req) => Some(&req.sender),
            Payload::DhtPing(req) => Some(&req.sender),
            _ => None,
        };
        if let Some(claimed) = claimed {
            if claimed.node_id != sender {
                warn!("{} sent a DHT request claiming to be {}", sender, claimed.node_id);
                let reply = error_reply(&message, ErrorCode::PeerRejected, "sender mismatch");
                return Dispatch::from(sender).reply(reply);
            }
        }

        let reply = match self.dht.handle_request(&message.payload).await {
            Ok(response) => message.create_response(response),
            Err(e) => {
                debug!("DHT request from {} failed: {}", sender, e);
                error_reply(&message, e.error_code(), e.to_string())
            }
        };
        Dispatch::from(sender).reply(reply)
    }

    async fn dispatch_relay(
        &self,
        sender: NodeId,
        observed_address: SocketAddr,
        message: Message,
    ) -> Dispatch {
        let Some(relay) = &self.relay else {
            let reply = error_reply(&message, ErrorCode::PeerRejected, "relay service disabled");
            return Dispatch::from(sender).reply(reply);
        };

        let mut dispatch = Dispatch::from(sender);
        match relay
            .handle_request(&sender, observed_address, &message.payload)
            .await
        {
            Ok(reply) => {
                if let Some(response) = reply.response {
                    dispatch.replies.push(message.create_response(response));
                }
                if let Some((target, payload)) = reply.forward {
                    dispatch.forwards.push((target, Message::new(payload)));
                }
            }
            Err(e) => {
                debug!("Relay request from {} failed: {}", sender, e);
                dispatch
                    .replies
                    .push(error_reply(&message, e.error_code(), e.to_string()));
            }
        }
        dispatch
    }

    async fn dispatch_nat(
        &self,
        sender: NodeId,
        observed_address: SocketAddr,
        message: Message,
    ) -> Dispatch {
        match &message.payload {
            Payload::NatPunchCoordinate(coordinate) => {
                self.start_punch(sender, coordinate.clone());
                Dispatch::from(sender)
            }
            Payload::ConnectionRequest(request) => {
                if request.from != sender {
                    let reply = error_reply(&message, ErrorCode::PeerRejected, "sender mismatch");
                    return Dispatch::from(sender).reply(reply);
                }
                let response = self.puncher.handle_connection_request(request).await;
                let reply = message.create_response(Payload::ConnectionResponse(response));
                Dispatch::from(sender).reply(reply)
            }
            // Probes and punch requests are served by the relay
            _ => self.dispatch_relay(sender, observed_address, message).await,
        }
    }

    /// Run a relay-forwarded punch in the background
    fn start_punch(&self, relay: NodeId, coordinate: NatPunchCoordinate) {
        let puncher = self.puncher.clone();
        info!(
            "Punch coordinate from relay {} for {} at {}",
            relay, coordinate.peer, coordinate.peer_address
        );
        tokio::spawn(async move {
            let peer = coordinate.peer;
            match puncher.punch(coordinate).await {
                PunchOutcome::Connected(address) => {
                    info!("Direct path to {} established at {}", peer, address)
                }
                PunchOutcome::Rejected(reason) => warn!("Punch to {} rejected: {}", peer, reason),
                PunchOutcome::TimedOut => warn!("Punch to {} timed out", peer),
            }
        });
    }

    async fn dispatch_transfer(&self, sender: NodeId, message: Message) -> Dispatch {
        let mut dispatch = Dispatch::from(sender);
        match self.transfers.handle(sender, &message.payload).await {
            Ok(reply) => {
                dispatch.replies.extend(
                    reply
                        .responses
                        .into_iter()
                        .map(|payload| message.create_response(payload)),
                );
                dispatch.events.extend(reply.event);
            }
            Err(e) => dispatch.replies.push(transfer_error_reply(&message, &e)),
        }
        dispatch
    }

    fn dispatch_other(&self, sender: NodeId, message: Message) -> Dispatch {
        match &message.payload {
            Payload::Ping(_) => {
                let reply = message.create_response(Payload::Pong(Pong));
                Dispatch::from(sender).reply(reply)
            }
            Payload::StatusUpdate(update) => {
                debug!("Status from {}: {}", sender, update.status);
                Dispatch::from(sender)
            }
            other => {
                debug!("No handler for {:?} from {}", other.message_type(), sender);
                let reply = error_reply(
                    &message,
                    ErrorCode::MalformedPayload,
                    format!("unsupported message type {:?}", other.message_type()),
                );
                Dispatch::from(sender).reply(reply)
            }
        }
    }
}

/// Fatal transfer failures end the session on both sides through a
/// `FileError`; anything else is a plain `Error` and the sender retries.
fn transfer_error_reply(request: &Message, error: &TransferError) -> Message {
    match error.file_hash() {
        Some(file_hash) if error.is_fatal() => {
            warn!("Transfer of {} failed: {}", file_hash, error);
            request.create_response(Payload::FileError(FileError {
                file_hash: file_hash.to_string(),
                code: error.error_code(),
                reason: error.to_string(),
            }))
        }
        _ => {
            debug!("Rejected {:?}: {}", request.message_type(), error);
            error_reply(request, error.error_code(), error.to_string())
        }
    }
}
