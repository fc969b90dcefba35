//! Routing-table records
//!
//! A [`NodeInfo`] wraps the wire-level [`PeerInfo`] with local liveness
//! bookkeeping that is never sent to other nodes.

use psu_protocol::{NodeId, PeerInfo};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp
fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Information about a node in the routing table
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Canonical description as advertised by the node
    pub peer: PeerInfo,

    /// Last successful communication (Unix timestamp)
    pub last_seen: u64,

    /// First time we heard about this node
    pub first_seen: u64,

    /// Round-trip time of the last successful exchange
    pub rtt_ms: f64,

    /// Consecutive failures
    pub failures: u32,

    /// Set when the node last failed to respond; cleared on any success
    pub stale: bool,

    /// Total successful communications
    pub total_successes: u64,
}

impl NodeInfo {
    /// Create a routing record for a newly discovered peer
    pub fn new(peer: PeerInfo) -> Self {
        let now = now();
        NodeInfo {
            last_seen: peer.last_seen.min(now),
            peer,
            first_seen: now,
            rtt_ms: 0.0,
            failures: 0,
            stale: false,
            total_successes: 0,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.peer.node_id
    }

    /// Merge a fresher advertisement, keeping local history
    pub fn refresh(&mut self, peer: PeerInfo) {
        self.peer = peer;
        self.last_seen = now();
        self.failures = 0;
        self.stale = false;
    }

    /// Record successful communication
    pub fn record_success(&mut self, rtt_ms: f64) {
        self.last_seen = now();
        self.rtt_ms = rtt_ms;
        self.failures = 0;
        self.stale = false;
        self.total_successes += 1;
        self.peer.reputation = (self.peer.reputation + 0.05).min(1.0);
    }

    /// Record failed communication
    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.stale = true;
        self.peer.reputation = (self.peer.reputation - 0.1).max(0.0);
    }

    /// Check if the node has not been heard from within `max_age_secs`
    pub fn is_older_than(&self, max_age_secs: u64) -> bool {
        now().saturating_sub(self.last_seen) > max_age_secs
    }

    /// Check if node should be evicted
    pub fn should_evict(&self, max_failures: u32) -> bool {
        self.failures >= max_failures
    }

    /// Calculate XOR distance to another node
    pub fn distance_to(&self, other: &NodeId) -> [u8; psu_crypto::NODE_ID_SIZE] {
        self.peer.node_id.distance(other)
    }

    /// Wire form with our view of `last_seen`
    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            last_seen: self.last_seen,
            ..self.peer.clone()
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use psu_crypto::NODE_ID_SIZE;

    /// Peer with every id byte set to `id`
    pub fn create_test_peer(id: u8) -> PeerInfo {
        create_test_peer_with_id(NodeId::from_bytes([id; NODE_ID_SIZE]))
    }

    pub fn create_test_peer_with_id(node_id: NodeId) -> PeerInfo {
        let first = node_id.as_bytes()[0];
        PeerInfo {
            node_id,
            public_key: [first; 32],
            address: format!("127.0.0.1:{}", 10_000 + first as u16)
                .parse()
                .expect("valid address"),
            services: ["dht".to_string()].into_iter().collect(),
            last_seen: now(),
            reputation: 0.5,
        }
    }

    pub fn create_test_node(id: u8) -> NodeInfo {
        NodeInfo::new(create_test_peer(id))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;

    #[test]
    fn test_record_failure_marks_stale() {
        let mut node = create_test_node(1);
        assert!(!node.stale);

        node.record_failure();
        node.record_failure();
        assert!(node.stale);
        assert_eq!(node.failures, 2);
        assert!(!node.should_evict(3));

        node.record_failure();
        assert!(node.should_evict(3));
    }

    #[test]
    fn test_success_resets_failures() {
        let mut node = create_test_node(1);
        node.record_failure();
        node.record_success(12.5);

        assert_eq!(node.failures, 0);
        assert!(!node.stale);
        assert_eq!(node.total_successes, 1);
        assert_eq!(node.rtt_ms, 12.5);
    }

    #[test]
    fn test_reputation_stays_in_range() {
        let mut node = create_test_node(1);
        for _ in 0..50 {
            node.record_success(1.0);
        }
        assert!(node.peer.reputation <= 1.0);
        for _ in 0..50 {
            node.record_failure();
        }
        assert!(node.peer.reputation >= 0.0);
    }

    #[test]
    fn test_is_older_than() {
        let mut node = create_test_node(1);
        assert!(!node.is_older_than(60));
        node.last_seen = 0;
        assert!(node.is_older_than(60));
    }
}
