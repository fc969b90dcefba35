//! DHT request handler for processing incoming queries
//!
//! This module computes responses to incoming DHT requests from the local
//! routing table and storage. Updating the routing table with the requester
//! is the caller's job (see [`DhtService::handle_request`]).
//!
//! [`DhtService::handle_request`]: crate::dht::DhtService::handle_request

use crate::error::{DhtError, Result};
use crate::routing_table::RoutingTable;
use crate::storage::{DhtRecord, DhtStorage};
use crate::K;
use psu_crypto::hashing::key_to_node_id;
use psu_protocol::payload::{
    DhtFindNode, DhtFindNodeResponse, DhtFindValue, DhtFindValueResponse, DhtPing,
    DhtPingResponse, DhtStore, DhtStoreResponse,
};
use psu_protocol::{Payload, PeerInfo};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// DHT request handler
///
/// Processes incoming DHT queries and generates appropriate responses.
pub struct DhtRequestHandler {
    /// Our own advertisement, sent as `sender` in every response
    local: PeerInfo,

    /// Routing table
    routing_table: Arc<RwLock<RoutingTable>>,

    /// Local DHT storage
    storage: Arc<RwLock<DhtStorage>>,

    /// Upper bound on nodes returned per response
    k: usize,
}

impl DhtRequestHandler {
    /// Create a new DHT request handler
    pub fn new(
        local: PeerInfo,
        routing_table: Arc<RwLock<RoutingTable>>,
        storage: Arc<RwLock<DhtStorage>>,
    ) -> Self {
        Self {
            local,
            routing_table,
            storage,
            k: K,
        }
    }

    /// Override the per-response node limit
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    /// Handle an incoming DHT request payload
    ///
    /// Returns the response payload, or `UnexpectedMessage` for anything that
    /// is not a DHT request.
    pub async fn handle(&self, request: &Payload) -> Result<Payload> {
        match request {
            Payload::DhtFindNode(req) => {
                Ok(Payload::DhtFindNodeResponse(self.handle_find_node(req).await))
            }
            Payload::DhtFindValue(req) => {
                Ok(Payload::DhtFindValueResponse(self.handle_find_value(req).await))
            }
            Payload::DhtStore(req) => Ok(Payload::DhtStoreResponse(self.handle_store(req).await)),
            Payload::DhtPing(req) => Ok(Payload::DhtPingResponse(self.handle_ping(req).await)),
            other => {
                warn!("Received non-DHT request in DHT handler: {:?}", other.message_type());
                Err(DhtError::UnexpectedMessage(other.message_type()))
            }
        }
    }

    /// Handle FIND_NODE request
    pub async fn handle_find_node(&self, request: &DhtFindNode) -> DhtFindNodeResponse {
        let limit = (request.max_nodes as usize).min(self.k);
        let nodes = {
            let rt = self.routing_table.read().await;
            rt.find_closest_peers(&request.target, limit)
        };

        debug!(
            "Responding to FIND_NODE from {} with {} nodes",
            request.sender.node_id,
            nodes.len()
        );

        DhtFindNodeResponse {
            sender: self.local.clone(),
            nodes,
        }
    }

    /// Handle FIND_VALUE request
    pub async fn handle_find_value(&self, request: &DhtFindValue) -> DhtFindValueResponse {
        let record = {
            let storage = self.storage.read().await;
            storage.get(&request.key).cloned()
        };

        if let Some(record) = record {
            info!(
                "Returning stored value to {} for key {}",
                request.sender.node_id, request.key
            );
            return DhtFindValueResponse {
                sender: self.local.clone(),
                value: Some(record.value),
                nodes: Vec::new(),
                expiration_time: Some(record.expires_at),
            };
        }

        debug!(
            "Value not found for key {}, returning closest nodes",
            request.key
        );
        let target = key_to_node_id(&request.key);
        let nodes = {
            let rt = self.routing_table.read().await;
            rt.find_closest_peers(&target, self.k)
        };

        DhtFindValueResponse {
            sender: self.local.clone(),
            value: None,
            nodes,
            expiration_time: None,
        }
    }

    /// Handle STORE request
    pub async fn handle_store(&self, request: &DhtStore) -> DhtStoreResponse {
        let rejected = |message: String| DhtStoreResponse {
            sender: self.local.clone(),
            success: false,
            error_message: Some(message),
            replication_count: 0,
            expiration_time: None,
        };

        if request.replication_factor == 0 {
            return rejected(DhtError::InvalidReplicationFactor(0).to_string());
        }

        let record = DhtRecord::new(
            request.key.clone(),
            request.value.clone(),
            request.ttl_secs,
            request.replication_factor,
            request.sender.node_id,
        );

        let result = self.storage.write().await.store(record);
        match result {
            Ok(expires_at) => {
                debug!(
                    "Stored key {} ({} bytes) for {}",
                    request.key,
                    request.value.len(),
                    request.sender.node_id
                );
                DhtStoreResponse {
                    sender: self.local.clone(),
                    success: true,
                    error_message: None,
                    replication_count: 1,
                    expiration_time: Some(expires_at),
                }
            }
            Err(e) => {
                warn!("Rejected STORE for key {}: {}", request.key, e);
                rejected(e.to_string())
            }
        }
    }

    /// Handle PING request
    pub async fn handle_ping(&self, _request: &DhtPing) -> DhtPingResponse {
        let storage = self.storage.read().await;
        DhtPingResponse {
            sender: self.local.clone(),
            load_factor: storage.load_factor(),
            stored_keys: storage.key_count() as u32,
        }
    }
}
