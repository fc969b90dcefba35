//! Relay-side membership registry
//!
//! Tracks relays that joined through this node, their reported load and the
//! time of their last heartbeat. Members that stop heartbeating for longer
//! than `heartbeat_interval * missed_heartbeat_threshold` are evicted.

use crate::error::{RelayError, Result};
use crate::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_MAX_RELAYS, DEFAULT_MISSED_HEARTBEAT_THRESHOLD};
use psu_protocol::payload::{
    RelayAnnounce, RelayHeartbeat, RelayJoin, RelayJoinResponse, RelayNodeList,
    RelayNodeListResponse,
};
use psu_protocol::{now_secs, NodeId, PeerInfo, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval members are asked to heartbeat at
    pub heartbeat_interval: Duration,

    /// Heartbeat intervals a member may miss before eviction
    pub missed_heartbeat_threshold: u32,

    /// Maximum members tracked
    pub max_relays: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            missed_heartbeat_threshold: DEFAULT_MISSED_HEARTBEAT_THRESHOLD,
            max_relays: DEFAULT_MAX_RELAYS,
        }
    }
}

/// A relay known to this registry
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEntry {
    /// Advertisement from the join or announce
    pub peer: PeerInfo,

    /// Reported load in `[0, 1]`
    pub load: f32,

    pub connected_peers: u32,

    pub uptime_secs: u64,

    /// Last heartbeat (Unix timestamp)
    pub last_heartbeat: u64,

    /// Whether the relay joined here (announced relays are only listed)
    pub member: bool,
}

impl RelayEntry {
    fn new(peer: PeerInfo, member: bool, now: u64) -> Self {
        RelayEntry {
            peer,
            load: 0.0,
            connected_peers: 0,
            uptime_secs: 0,
            last_heartbeat: now,
            member,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.peer.node_id
    }
}

/// Registry of relays that joined or were announced to this node
#[derive(Debug)]
pub struct RelayRegistry {
    /// This relay's own advertisement, listed first in join responses
    local: PeerInfo,

    config: RegistryConfig,

    relays: HashMap<NodeId, RelayEntry>,
}

impl RelayRegistry {
    pub fn new(local: PeerInfo, config: RegistryConfig) -> Self {
        Self {
            local,
            config,
            relays: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&RelayEntry> {
        self.relays.get(node_id)
    }

    /// Seconds without a heartbeat after which a member is evicted
    pub fn liveness_threshold_secs(&self) -> u64 {
        self.config.heartbeat_interval.as_secs() * self.config.missed_heartbeat_threshold as u64
    }

    /// Handle a join request
    ///
    /// A rejected join still produces a response, with `success = false`.
    pub fn handle_join(&mut self, join: &RelayJoin) -> RelayJoinResponse {
        self.handle_join_at(join, now_secs())
    }

    pub fn handle_join_at(&mut self, join: &RelayJoin, now: u64) -> RelayJoinResponse {
        match self.admit(join, now) {
            Ok(()) => {
                info!("Relay {} joined ({})", join.relay.node_id, join.relay.address);
                RelayJoinResponse {
                    success: true,
                    known_relays: self.known_relays_for(&join.relay.node_id),
                    error_message: None,
                    heartbeat_interval_secs: self.config.heartbeat_interval.as_secs() as u32,
                }
            }
            Err(e) => {
                warn!("Rejected join from {}: {}", join.relay.node_id, e);
                RelayJoinResponse {
                    success: false,
                    known_relays: Vec::new(),
                    error_message: Some(e.to_string()),
                    heartbeat_interval_secs: 0,
                }
            }
        }
    }

    fn admit(&mut self, join: &RelayJoin, now: u64) -> Result<()> {
        if join.protocol_version != PROTOCOL_VERSION {
            return Err(RelayError::UnsupportedVersion(join.protocol_version));
        }
        if join.relay.node_id == self.local.node_id {
            return Err(RelayError::JoinRejected("cannot join self".to_string()));
        }

        let node_id = join.relay.node_id;
        if !self.relays.contains_key(&node_id) && self.relays.len() >= self.config.max_relays {
            // Make room from dead members before refusing
            self.evict_stale_at(now);
            if self.relays.len() >= self.config.max_relays {
                return Err(RelayError::RegistryFull(self.config.max_relays));
            }
        }

        self.relays
            .insert(node_id, RelayEntry::new(join.relay.clone(), true, now));
        Ok(())
    }

    /// Relays to hand a newcomer: this node first, then every other entry
    fn known_relays_for(&self, joiner: &NodeId) -> Vec<PeerInfo> {
        let mut relays = vec![self.local.clone()];
        relays.extend(
            self.relays
                .values()
                .filter(|entry| entry.node_id() != joiner)
                .map(|entry| entry.peer.clone()),
        );
        relays
    }

    /// Record a member heartbeat
    pub fn handle_heartbeat(&mut self, heartbeat: &RelayHeartbeat) -> Result<()> {
        self.handle_heartbeat_at(heartbeat, now_secs())
    }

    pub fn handle_heartbeat_at(&mut self, heartbeat: &RelayHeartbeat, now: u64) -> Result<()> {
        let entry = self
            .relays
            .get_mut(&heartbeat.relay_node_id)
            .filter(|entry| entry.member)
            .ok_or(RelayError::UnknownMember(heartbeat.relay_node_id))?;

        entry.load = heartbeat.load.clamp(0.0, 1.0);
        entry.connected_peers = heartbeat.connected_peers;
        entry.uptime_secs = heartbeat.uptime_secs;
        entry.last_heartbeat = now;
        entry.peer.last_seen = now;

        debug!(
            "Heartbeat from {}: load {:.2}, {} peers",
            heartbeat.relay_node_id, entry.load, entry.connected_peers
        );
        Ok(())
    }

    /// Learn about a relay announced by another relay
    pub fn handle_announce(&mut self, announce: &RelayAnnounce) {
        let node_id = announce.relay.node_id;
        if node_id == self.local.node_id {
            return;
        }
        let now = now_secs();
        let known = self.relays.len();
        match self.relays.get_mut(&node_id) {
            Some(entry) => {
                entry.peer = announce.relay.clone();
                entry.last_heartbeat = now;
            }
            None if known < self.config.max_relays => {
                debug!("Learned relay {} from announcement", node_id);
                self.relays
                    .insert(node_id, RelayEntry::new(announce.relay.clone(), false, now));
            }
            None => debug!("Ignoring announcement of {}: registry full", node_id),
        }
    }

    /// Least loaded relays first, capped at `max_relays`
    pub fn node_list(&self, request: &RelayNodeList) -> RelayNodeListResponse {
        let mut entries: Vec<&RelayEntry> = self.relays.values().collect();
        entries.sort_by(|a, b| a.load.total_cmp(&b.load));

        RelayNodeListResponse {
            relays: entries
                .into_iter()
                .take(request.max_relays as usize)
                .map(|entry| entry.peer.clone())
                .collect(),
        }
    }

    /// Evict relays whose last heartbeat is older than the liveness threshold
    pub fn evict_stale(&mut self) -> Vec<NodeId> {
        self.evict_stale_at(now_secs())
    }

    pub fn evict_stale_at(&mut self, now: u64) -> Vec<NodeId> {
        let threshold = self.liveness_threshold_secs();
        let stale: Vec<NodeId> = self
            .relays
            .values()
            .filter(|entry| now.saturating_sub(entry.last_heartbeat) > threshold)
            .map(|entry| *entry.node_id())
            .collect();

        for node_id in &stale {
            self.relays.remove(node_id);
            info!("Evicted relay {} after missed heartbeats", node_id);
        }
        stale
    }

    /// Sum of member-reported connected peers
    pub fn total_connected_peers(&self) -> u32 {
        self.relays.values().map(|entry| entry.connected_peers).sum()
    }
}
