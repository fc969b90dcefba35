//! Component transports over signed envelopes
//!
//! The DHT, relay client and hole puncher talk to peers through small
//! traits. [`NetworkTransport`] implements all of them on top of the node's
//! [`Network`].

use crate::error::NodeError;
use crate::network::Network;
use async_trait::async_trait;
use psu_dht::{DhtError, DhtTransport};
use psu_protocol::payload::{
    ConnectionRequest, ConnectionResponse, DhtFindNode, DhtFindNodeResponse, DhtFindValue,
    DhtFindValueResponse, DhtPing, DhtPingResponse, DhtStore, DhtStoreResponse,
};
use psu_protocol::{ErrorCode, Payload, PeerInfo, ProtocolError};
use psu_relay::{PunchTransport, RelayChannel, RelayError};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// Envelope-backed transport for every component
///
/// Holds the network weakly; the network owns the dispatcher which owns the
/// components holding this transport.
#[derive(Clone)]
pub struct NetworkTransport {
    network: Weak<Network>,
}

impl NetworkTransport {
    pub fn new(network: &Arc<Network>) -> Self {
        Self {
            network: Arc::downgrade(network),
        }
    }

    fn network(&self) -> Result<Arc<Network>, NodeError> {
        self.network
            .upgrade()
            .ok_or_else(|| NodeError::Config("network shut down".to_string()))
    }

    async fn request(&self, peer: &PeerInfo, payload: Payload) -> Result<Payload, NodeError> {
        self.network()?.call(peer, payload).await
    }
}

fn dht_error(error: NodeError) -> DhtError {
    match error {
        NodeError::Remote {
            code: ErrorCode::PeerRejected,
            message,
        } => DhtError::Rejected(message),
        NodeError::Protocol(ProtocolError::RequestTimeout) => DhtError::QueryTimeout,
        other => DhtError::Transport(other.to_string()),
    }
}

fn relay_error(error: NodeError) -> RelayError {
    match error {
        NodeError::Protocol(ProtocolError::RequestTimeout) => RelayError::Timeout,
        other => RelayError::Transport(other.to_string()),
    }
}

macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            Payload::$variant(response) => Ok(response),
            other => Err(DhtError::UnexpectedMessage(other.message_type())),
        }
    };
}

#[async_trait]
impl DhtTransport for NetworkTransport {
    async fn find_node(
        &self,
        peer: &PeerInfo,
        request: DhtFindNode,
    ) -> psu_dht::Result<DhtFindNodeResponse> {
        let response = self
            .request(peer, Payload::DhtFindNode(request))
            .await
            .map_err(dht_error)?;
        expect_response!(response, DhtFindNodeResponse)
    }

    async fn find_value(
        &self,
        peer: &PeerInfo,
        request: DhtFindValue,
    ) -> psu_dht::Result<DhtFindValueResponse> {
        let response = self
            .request(peer, Payload::DhtFindValue(request))
            .await
            .map_err(dht_error)?;
        expect_response!(response, DhtFindValueResponse)
    }

    async fn store(&self, peer: &PeerInfo, request: DhtStore) -> psu_dht::Result<DhtStoreResponse> {
        let response = self
            .request(peer, Payload::DhtStore(request))
            .await
            .map_err(dht_error)?;
        expect_response!(response, DhtStoreResponse)
    }

    async fn ping(&self, peer: &PeerInfo, request: DhtPing) -> psu_dht::Result<DhtPingResponse> {
        let response = self
            .request(peer, Payload::DhtPing(request))
            .await
            .map_err(dht_error)?;
        expect_response!(response, DhtPingResponse)
    }
}

#[async_trait]
impl RelayChannel for NetworkTransport {
    /// `Error` replies are handed back as payloads; the membership logic
    /// reads eviction from them.
    async fn request(&self, relay: &PeerInfo, payload: Payload) -> psu_relay::Result<Payload> {
        let network = self.network().map_err(relay_error)?;
        network.request(relay, payload).await.map_err(relay_error)
    }
}

#[async_trait]
impl PunchTransport for NetworkTransport {
    async fn connect(
        &self,
        address: SocketAddr,
        request: ConnectionRequest,
    ) -> psu_relay::Result<ConnectionResponse> {
        let network = self.network().map_err(relay_error)?;
        match network
            .request_at(address, Payload::ConnectionRequest(request))
            .await
            .map_err(relay_error)?
        {
            Payload::ConnectionResponse(response) => Ok(response),
            other => Err(RelayError::UnexpectedMessage(other.message_type())),
        }
    }
}

/// Transport for components that never reach a peer
#[cfg(test)]
pub(crate) struct NullTransport;

#[cfg(test)]
#[async_trait]
impl DhtTransport for NullTransport {
    async fn find_node(&self, _: &PeerInfo, _: DhtFindNode) -> psu_dht::Result<DhtFindNodeResponse> {
        Err(DhtError::Transport("offline".to_string()))
    }

    async fn find_value(
        &self,
        _: &PeerInfo,
        _: DhtFindValue,
    ) -> psu_dht::Result<DhtFindValueResponse> {
        Err(DhtError::Transport("offline".to_string()))
    }

    async fn store(&self, _: &PeerInfo, _: DhtStore) -> psu_dht::Result<DhtStoreResponse> {
        Err(DhtError::Transport("offline".to_string()))
    }

    async fn ping(&self, _: &PeerInfo, _: DhtPing) -> psu_dht::Result<DhtPingResponse> {
        Err(DhtError::Transport("offline".to_string()))
    }
}

#[cfg(test)]
#[async_trait]
impl PunchTransport for NullTransport {
    async fn connect(
        &self,
        _: SocketAddr,
        _: ConnectionRequest,
    ) -> psu_relay::Result<ConnectionResponse> {
        Err(RelayError::Transport("offline".to_string()))
    }
}
