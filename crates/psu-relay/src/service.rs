//! Relay-side request handling
//!
//! Owns the membership registry and the NAT coordinator and turns incoming
//! relay and NAT requests into responses, plus at most one message that has
//! to be forwarded to another connected peer.

use crate::error::{RelayError, Result};
use crate::health::{health_response, HealthSnapshot};
use crate::nat::{NatConfig, NatCoordinator};
use crate::registry::{RegistryConfig, RelayRegistry};
use psu_protocol::payload::RelayHeartbeat;
use psu_protocol::{NodeId, Payload, PeerInfo};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Relay service tunables
#[derive(Debug, Clone)]
pub struct RelayServiceConfig {
    pub registry: RegistryConfig,
    pub nat: NatConfig,
    /// Connections at which load reaches 1.0
    pub max_connections: u32,
}

impl Default for RelayServiceConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            nat: NatConfig::default(),
            max_connections: 256,
        }
    }
}

/// What to send after handling a relay request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelayReply {
    /// Correlated response to the requester
    pub response: Option<Payload>,
    /// Unsolicited message for another peer
    pub forward: Option<(NodeId, Payload)>,
}

impl RelayReply {
    fn respond(payload: Payload) -> Self {
        Self {
            response: Some(payload),
            forward: None,
        }
    }
}

/// Relay and NAT coordination for one node
pub struct RelayService {
    local: PeerInfo,
    config: RelayServiceConfig,
    registry: RwLock<RelayRegistry>,
    nat: Mutex<NatCoordinator>,
    connected_peers: AtomicU32,
    started: Instant,
}

impl RelayService {
    pub fn new(local: PeerInfo, config: RelayServiceConfig) -> Self {
        Self {
            registry: RwLock::new(RelayRegistry::new(local.clone(), config.registry.clone())),
            nat: Mutex::new(NatCoordinator::new(config.nat.clone())),
            local,
            config,
            connected_peers: AtomicU32::new(0),
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> &RwLock<RelayRegistry> {
        &self.registry
    }

    /// Update the number of open connections used to derive load
    pub fn set_connected_peers(&self, count: u32) {
        self.connected_peers.store(count, Ordering::Relaxed);
    }

    pub fn load(&self) -> f32 {
        let connected = self.connected_peers.load(Ordering::Relaxed) as f32;
        (connected / self.config.max_connections.max(1) as f32).min(1.0)
    }

    /// Handle one relay or NAT request from `from`, seen at `observed_address`
    pub async fn handle_request(
        &self,
        from: &NodeId,
        observed_address: SocketAddr,
        payload: &Payload,
    ) -> Result<RelayReply> {
        let started = Instant::now();
        match payload {
            Payload::RelayJoin(join) => {
                let response = self.registry.write().await.handle_join(join);
                Ok(RelayReply::respond(Payload::RelayJoinResponse(response)))
            }
            Payload::RelayHeartbeat(heartbeat) => {
                if &heartbeat.relay_node_id != from {
                    return Err(RelayError::UnknownMember(heartbeat.relay_node_id));
                }
                let mut registry = self.registry.write().await;
                registry.handle_heartbeat(heartbeat)?;
                let ack = RelayHeartbeat {
                    relay_node_id: self.local.node_id,
                    load: self.load(),
                    connected_peers: self.connected_peers.load(Ordering::Relaxed),
                    uptime_secs: self.started.elapsed().as_secs(),
                };
                Ok(RelayReply::respond(Payload::RelayHeartbeat(ack)))
            }
            Payload::RelayAnnounce(announce) => {
                self.registry.write().await.handle_announce(announce);
                Ok(RelayReply::default())
            }
            Payload::RelayHealthCheck(check) => {
                let snapshot = HealthSnapshot {
                    relay_node_id: self.local.node_id,
                    load: self.load(),
                    connected_peers: self.connected_peers.load(Ordering::Relaxed),
                    members: self.registry.read().await.len(),
                    uptime_secs: self.started.elapsed().as_secs(),
                };
                let response = health_response(check, &snapshot, started);
                Ok(RelayReply::respond(Payload::RelayHealthResponse(response)))
            }
            Payload::RelayNodeList(request) => {
                let response = self.registry.read().await.node_list(request);
                Ok(RelayReply::respond(Payload::RelayNodeListResponse(response)))
            }
            Payload::NatProbe(probe) => {
                let response = self
                    .nat
                    .lock()
                    .await
                    .handle_probe(*from, observed_address, probe);
                Ok(RelayReply::respond(Payload::NatProbeResponse(response)))
            }
            Payload::NatPunchRequest(request) => {
                let plan = self
                    .nat
                    .lock()
                    .await
                    .coordinate(*from, observed_address, request)?;
                Ok(RelayReply {
                    response: Some(Payload::NatPunchCoordinate(plan.to_requester)),
                    forward: Some((plan.target, Payload::NatPunchCoordinate(plan.to_target))),
                })
            }
            other => Err(RelayError::UnexpectedMessage(other.message_type())),
        }
    }

    /// Evict silent members and stale observations
    pub async fn run_maintenance(&self) -> usize {
        let evicted = self.registry.write().await.evict_stale().len();
        let expired = self.nat.lock().await.expire_observations();
        if evicted > 0 || expired > 0 {
            debug!(
                "Relay maintenance: {} members evicted, {} observations expired",
                evicted, expired
            );
        }
        evicted
    }
}
