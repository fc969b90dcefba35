//! Client side of relay membership
//!
//! `Unjoined -> Joining -> Joined -> Evicted`. A rejected join returns to
//! `Unjoined`; an evicted member may join again.

use crate::error::{RelayError, Result};
use crate::DEFAULT_MISSED_HEARTBEAT_THRESHOLD;
use async_trait::async_trait;
use psu_protocol::payload::{ErrorPayload, RelayHeartbeat, RelayJoin, RelayJoinResponse};
use psu_protocol::{ErrorCode, Payload, PeerInfo, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Membership state towards one relay
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipState {
    Unjoined,
    /// Join sent, awaiting response
    Joining,
    Joined {
        heartbeat_interval: Duration,
        /// Heartbeats sent without acknowledgement
        missed: u32,
    },
    Evicted,
}

impl MembershipState {
    fn name(&self) -> &'static str {
        match self {
            MembershipState::Unjoined => "unjoined",
            MembershipState::Joining => "joining",
            MembershipState::Joined { .. } => "joined",
            MembershipState::Evicted => "evicted",
        }
    }
}

/// Membership of the local node in one relay
#[derive(Debug)]
pub struct RelayMembership {
    local: PeerInfo,
    relay: PeerInfo,
    state: MembershipState,
    missed_heartbeat_threshold: u32,
    known_relays: Vec<PeerInfo>,
    last_error: Option<String>,
    started: Instant,
}

impl RelayMembership {
    pub fn new(local: PeerInfo, relay: PeerInfo) -> Self {
        Self::with_threshold(local, relay, DEFAULT_MISSED_HEARTBEAT_THRESHOLD)
    }

    pub fn with_threshold(local: PeerInfo, relay: PeerInfo, missed_heartbeat_threshold: u32) -> Self {
        Self {
            local,
            relay,
            state: MembershipState::Unjoined,
            missed_heartbeat_threshold: missed_heartbeat_threshold.max(1),
            known_relays: Vec::new(),
            last_error: None,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> &MembershipState {
        &self.state
    }

    pub fn relay(&self) -> &PeerInfo {
        &self.relay
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, MembershipState::Joined { .. })
    }

    /// Relays learned from the last successful join
    pub fn known_relays(&self) -> &[PeerInfo] {
        &self.known_relays
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn invalid(&self, event: &'static str) -> RelayError {
        RelayError::InvalidState {
            state: self.state.name(),
            event,
        }
    }

    /// Build the join request and enter `Joining`
    pub fn begin_join(&mut self) -> Result<RelayJoin> {
        match self.state {
            MembershipState::Unjoined | MembershipState::Evicted => {
                self.state = MembershipState::Joining;
                Ok(RelayJoin {
                    relay: self.local.clone(),
                    protocol_version: PROTOCOL_VERSION,
                })
            }
            _ => Err(self.invalid("join")),
        }
    }

    /// Apply the relay's answer to our join
    pub fn on_join_response(&mut self, response: &RelayJoinResponse) -> Result<()> {
        if self.state != MembershipState::Joining {
            return Err(self.invalid("join response"));
        }

        if response.success {
            self.state = MembershipState::Joined {
                heartbeat_interval: Duration::from_secs(response.heartbeat_interval_secs.max(1) as u64),
                missed: 0,
            };
            self.known_relays = response.known_relays.clone();
            self.last_error = None;
            Ok(())
        } else {
            let reason = response
                .error_message
                .clone()
                .unwrap_or_else(|| "join refused".to_string());
            self.state = MembershipState::Unjoined;
            self.last_error = Some(reason.clone());
            Err(RelayError::JoinRejected(reason))
        }
    }

    /// Abandon an in-flight join (timeout or transport failure)
    pub fn on_join_failed(&mut self, reason: impl Into<String>) {
        if self.state == MembershipState::Joining {
            self.state = MembershipState::Unjoined;
            self.last_error = Some(reason.into());
        }
    }

    /// Build the next heartbeat; counts as unacknowledged until acked
    pub fn next_heartbeat(&mut self, load: f32, connected_peers: u32) -> Result<RelayHeartbeat> {
        match &mut self.state {
            MembershipState::Joined { missed, .. } => {
                *missed += 1;
            }
            _ => return Err(self.invalid("heartbeat")),
        }
        Ok(RelayHeartbeat {
            relay_node_id: self.local.node_id,
            load: load.clamp(0.0, 1.0),
            connected_peers,
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }

    /// The relay acknowledged our latest heartbeat
    pub fn on_heartbeat_ack(&mut self) {
        if let MembershipState::Joined { missed, .. } = &mut self.state {
            *missed = 0;
        }
    }

    /// A heartbeat went unacknowledged; evicts once the threshold is reached
    pub fn on_heartbeat_missed(&mut self) -> Result<()> {
        let MembershipState::Joined { missed, .. } = self.state else {
            return Err(self.invalid("missed heartbeat"));
        };
        if missed >= self.missed_heartbeat_threshold {
            warn!("Evicted from relay {} after {} missed heartbeats", self.relay.node_id, missed);
            self.state = MembershipState::Evicted;
            return Err(RelayError::Evicted { missed });
        }
        Ok(())
    }

    /// The relay no longer knows us
    pub fn on_evicted(&mut self) {
        self.state = MembershipState::Evicted;
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.state {
            MembershipState::Joined {
                heartbeat_interval, ..
            } => Some(heartbeat_interval),
            _ => None,
        }
    }
}

/// Request/response channel to a relay
///
/// Implemented over the envelope connection by the node; mocked in tests.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    async fn request(&self, relay: &PeerInfo, payload: Payload) -> Result<Payload>;
}

/// Drives a [`RelayMembership`] over a [`RelayChannel`]
pub struct RelayClient {
    membership: Mutex<RelayMembership>,
    channel: Arc<dyn RelayChannel>,
    request_timeout: Duration,
}

impl RelayClient {
    pub fn new(membership: RelayMembership, channel: Arc<dyn RelayChannel>, request_timeout: Duration) -> Self {
        Self {
            membership: Mutex::new(membership),
            channel,
            request_timeout,
        }
    }

    pub async fn state(&self) -> MembershipState {
        self.membership.lock().await.state().clone()
    }

    pub async fn known_relays(&self) -> Vec<PeerInfo> {
        self.membership.lock().await.known_relays().to_vec()
    }

    /// Interval the relay asked for, once joined
    pub async fn heartbeat_interval(&self) -> Option<Duration> {
        self.membership.lock().await.heartbeat_interval()
    }

    async fn send(&self, relay: &PeerInfo, payload: Payload) -> Result<Payload> {
        match timeout(self.request_timeout, self.channel.request(relay, payload)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout),
        }
    }

    /// Join the relay; returns the relays it told us about
    pub async fn join(&self) -> Result<Vec<PeerInfo>> {
        let (relay, request) = {
            let mut membership = self.membership.lock().await;
            let request = membership.begin_join()?;
            (membership.relay().clone(), request)
        };

        debug!("Joining relay {}", relay.node_id);
        let response = self.send(&relay, Payload::RelayJoin(request)).await;

        let mut membership = self.membership.lock().await;
        match response {
            Ok(Payload::RelayJoinResponse(response)) => {
                membership.on_join_response(&response)?;
                info!(
                    "Joined relay {}, {} relays known",
                    relay.node_id,
                    response.known_relays.len()
                );
                Ok(response.known_relays)
            }
            Ok(other) => {
                membership.on_join_failed("unexpected join reply");
                Err(RelayError::UnexpectedMessage(other.message_type()))
            }
            Err(e) => {
                membership.on_join_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Send one heartbeat and account for its acknowledgement
    pub async fn heartbeat(&self, load: f32, connected_peers: u32) -> Result<()> {
        let (relay, heartbeat) = {
            let mut membership = self.membership.lock().await;
            let heartbeat = membership.next_heartbeat(load, connected_peers)?;
            (membership.relay().clone(), heartbeat)
        };

        let response = self.send(&relay, Payload::RelayHeartbeat(heartbeat)).await;

        let mut membership = self.membership.lock().await;
        match response {
            Ok(Payload::RelayHeartbeat(_)) => {
                membership.on_heartbeat_ack();
                Ok(())
            }
            Ok(Payload::Error(ErrorPayload {
                code: ErrorCode::NotFound,
                ..
            })) => {
                warn!("Relay {} no longer lists us", relay.node_id);
                membership.on_evicted();
                Err(RelayError::Evicted { missed: 0 })
            }
            Ok(other) => {
                debug!("Unexpected heartbeat reply {:?}", other.message_type());
                membership.on_heartbeat_missed()
            }
            Err(e) => {
                debug!("Heartbeat to {} failed: {}", relay.node_id, e);
                membership.on_heartbeat_missed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::create_test_peer;

    fn membership() -> RelayMembership {
        RelayMembership::with_threshold(create_test_peer(1), create_test_peer(2), 2)
    }

    fn accepted() -> RelayJoinResponse {
        RelayJoinResponse {
            success: true,
            known_relays: vec![create_test_peer(2), create_test_peer(3)],
            error_message: None,
            heartbeat_interval_secs: 30,
        }
    }

    #[test]
    fn test_join_flow() {
        let mut m = membership();
        assert_eq!(m.state(), &MembershipState::Unjoined);

        let join = m.begin_join().unwrap();
        assert_eq!(join.relay.node_id, create_test_peer(1).node_id);
        assert_eq!(m.state(), &MembershipState::Joining);

        m.on_join_response(&accepted()).unwrap();
        assert!(m.is_joined());
        assert_eq!(m.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert_eq!(m.known_relays().len(), 2);
    }

    #[test]
    fn test_rejected_join_returns_to_unjoined() {
        let mut m = membership();
        m.begin_join().unwrap();
        let result = m.on_join_response(&RelayJoinResponse {
            success: false,
            known_relays: vec![],
            error_message: Some("full".to_string()),
            heartbeat_interval_secs: 0,
        });

        assert!(matches!(result, Err(RelayError::JoinRejected(ref r)) if r == "full"));
        assert_eq!(m.state(), &MembershipState::Unjoined);
        assert_eq!(m.last_error(), Some("full"));
    }

    #[test]
    fn test_double_join_is_invalid() {
        let mut m = membership();
        m.begin_join().unwrap();
        assert!(matches!(m.begin_join(), Err(RelayError::InvalidState { .. })));
    }

    #[test]
    fn test_heartbeat_requires_joined() {
        let mut m = membership();
        assert!(m.next_heartbeat(0.1, 0).is_err());
    }

    #[test]
    fn test_missed_heartbeats_evict() {
        let mut m = membership();
        m.begin_join().unwrap();
        m.on_join_response(&accepted()).unwrap();

        m.next_heartbeat(0.1, 0).unwrap();
        assert!(m.on_heartbeat_missed().is_ok());

        m.next_heartbeat(0.1, 0).unwrap();
        assert!(matches!(
            m.on_heartbeat_missed(),
            Err(RelayError::Evicted { missed: 2 })
        ));
        assert_eq!(m.state(), &MembershipState::Evicted);

        // Evicted members may join again
        assert!(m.begin_join().is_ok());
    }

    #[test]
    fn test_ack_resets_missed() {
        let mut m = membership();
        m.begin_join().unwrap();
        m.on_join_response(&accepted()).unwrap();

        m.next_heartbeat(0.1, 0).unwrap();
        m.on_heartbeat_ack();
        m.next_heartbeat(0.1, 0).unwrap();
        assert!(m.on_heartbeat_missed().is_ok());
        assert!(m.is_joined());
    }
}
