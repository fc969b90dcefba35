//! Relay-side NAT traversal coordination
//!
//! Peers probe the relay to learn their public address. A punch request
//! for a target that has probed produces a pair of `NatPunchCoordinate`
//! messages, one for each side, sharing a session id and an attempt window.

use crate::error::{RelayError, Result};
use crate::{DEFAULT_PUNCH_LEAD_MILLIS, DEFAULT_PUNCH_WINDOW_MILLIS};
use psu_protocol::payload::{NatProbe, NatProbeResponse, NatPunchCoordinate, NatPunchRequest};
use psu_protocol::{now_millis, NodeId};
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

/// Coordinator tunables
#[derive(Debug, Clone)]
pub struct NatConfig {
    /// Delay between issuing coordinates and the start of the attempt
    pub punch_lead: Duration,

    /// How long each side keeps trying
    pub punch_window: Duration,

    /// How long a probe observation stays usable
    pub observation_ttl: Duration,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            punch_lead: Duration::from_millis(DEFAULT_PUNCH_LEAD_MILLIS),
            punch_window: Duration::from_millis(DEFAULT_PUNCH_WINDOW_MILLIS),
            observation_ttl: Duration::from_secs(300),
        }
    }
}

/// Where a peer was last seen from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub observed_address: SocketAddr,
    pub local_address: SocketAddr,
    pub observed_at_millis: i64,
}

/// Coordinates addressed to both sides of one punch
#[derive(Debug, Clone, PartialEq)]
pub struct PunchPlan {
    pub requester: NodeId,
    pub target: NodeId,
    /// Sent back to the requester
    pub to_requester: NatPunchCoordinate,
    /// Forwarded to the target over its relay connection
    pub to_target: NatPunchCoordinate,
}

/// Tracks observed addresses and issues punch coordinates
#[derive(Debug)]
pub struct NatCoordinator {
    config: NatConfig,
    observations: HashMap<NodeId, Observation>,
}

impl NatCoordinator {
    pub fn new(config: NatConfig) -> Self {
        Self {
            config,
            observations: HashMap::new(),
        }
    }

    /// Record a probe and report the address it arrived from
    pub fn handle_probe(
        &mut self,
        from: NodeId,
        observed_address: SocketAddr,
        probe: &NatProbe,
    ) -> NatProbeResponse {
        if observed_address != probe.local_address {
            debug!(
                "{} is behind NAT: local {} observed {}",
                from, probe.local_address, observed_address
            );
        }
        self.observations.insert(
            from,
            Observation {
                observed_address,
                local_address: probe.local_address,
                observed_at_millis: now_millis(),
            },
        );
        NatProbeResponse { observed_address }
    }

    /// Fresh observation of `node_id`, if any
    pub fn observation(&self, node_id: &NodeId) -> Option<&Observation> {
        self.observation_at(node_id, now_millis())
    }

    fn observation_at(&self, node_id: &NodeId, now: i64) -> Option<&Observation> {
        let ttl = self.config.observation_ttl.as_millis() as i64;
        self.observations
            .get(node_id)
            .filter(|obs| now - obs.observed_at_millis <= ttl)
    }

    /// Plan a simultaneous punch between `requester` and `request.target`
    ///
    /// `requester_address` is the address the request arrived from, used
    /// when the requester has not probed.
    pub fn coordinate(
        &mut self,
        requester: NodeId,
        requester_address: SocketAddr,
        request: &NatPunchRequest,
    ) -> Result<PunchPlan> {
        if request.target == requester {
            return Err(RelayError::InvalidPunchRequest(
                "target is the requester".to_string(),
            ));
        }

        let now = now_millis();
        let target_address = self
            .observation_at(&request.target, now)
            .map(|obs| obs.observed_address)
            .ok_or(RelayError::PeerUnreachable(request.target))?;
        let requester_address = self
            .observation_at(&requester, now)
            .map(|obs| obs.observed_address)
            .unwrap_or(requester_address);

        let mut session_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut session_id);
        let attempt_at_millis = now + self.config.punch_lead.as_millis() as i64;
        let window_millis = self.config.punch_window.as_millis().min(u32::MAX as u128) as u32;

        info!(
            "Coordinating punch {} <-> {} ({} <-> {})",
            requester, request.target, requester_address, target_address
        );

        Ok(PunchPlan {
            requester,
            target: request.target,
            to_requester: NatPunchCoordinate {
                session_id,
                peer: request.target,
                peer_address: target_address,
                attempt_at_millis,
                window_millis,
            },
            to_target: NatPunchCoordinate {
                session_id,
                peer: requester,
                peer_address: requester_address,
                attempt_at_millis,
                window_millis,
            },
        })
    }

    /// Drop observations older than the configured TTL
    pub fn expire_observations(&mut self) -> usize {
        let ttl = self.config.observation_ttl.as_millis() as i64;
        let now = now_millis();
        let before = self.observations.len();
        self.observations
            .retain(|_, obs| now - obs.observed_at_millis <= ttl);
        before - self.observations.len()
    }
}
