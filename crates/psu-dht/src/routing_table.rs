//! Kademlia routing table

use crate::kbucket::{FailureOutcome, InsertOutcome, KBucket};
use crate::node_info::NodeInfo;
use crate::NUM_BUCKETS;
use psu_crypto::NODE_ID_SIZE;
use psu_protocol::{NodeId, PeerInfo};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Get current timestamp
fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Kademlia routing table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our local node ID
    local_node_id: NodeId,

    /// 160 k-buckets (one per bit of node ID distance)
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(local_node_id: NodeId) -> Self {
        let buckets = (0..NUM_BUCKETS).map(KBucket::new).collect();
        RoutingTable {
            local_node_id,
            buckets,
        }
    }

    /// Get our local node ID
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Get total number of nodes in routing table
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// Calculate bucket index for a node ID
    ///
    /// The index is the length of the common prefix with the local id:
    /// bucket 0 holds the most distant half of the id space, bucket 159
    /// the single closest id. Returns `None` for the local id itself.
    pub fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        let prefix = self.local_node_id.common_prefix_len(node_id);
        (prefix < NUM_BUCKETS).then_some(prefix)
    }

    /// Add or update a node in the routing table
    pub fn add_or_update(&mut self, peer: PeerInfo) -> InsertOutcome {
        let Some(bucket_idx) = self.bucket_index(&peer.node_id) else {
            return InsertOutcome::Ignored;
        };
        let outcome = self.buckets[bucket_idx].add_or_update(peer, now());
        if let InsertOutcome::Full { probe } = &outcome {
            debug!(
                "Bucket {} full, probing least recently seen {}",
                bucket_idx, probe.node_id
            );
        }
        outcome
    }

    /// Record a successful exchange with a known node
    pub fn record_success(&mut self, node_id: &NodeId, rtt_ms: f64) -> bool {
        match self.bucket_index(node_id) {
            Some(idx) => self.buckets[idx].record_success(node_id, rtt_ms, now()),
            None => false,
        }
    }

    /// Record a failed exchange with a known node
    pub fn record_failure(&mut self, node_id: &NodeId) -> FailureOutcome {
        let Some(idx) = self.bucket_index(node_id) else {
            return FailureOutcome::Unknown;
        };
        let outcome = self.buckets[idx].record_failure(node_id);
        if let FailureOutcome::Evicted { promoted } = &outcome {
            debug!(
                "Evicted unresponsive node {} (promoted {:?})",
                node_id, promoted
            );
        }
        outcome
    }

    /// Find a node by ID
    pub fn find_node(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        let idx = self.bucket_index(node_id)?;
        self.buckets[idx].find_node(node_id)
    }

    /// Remove a node from the routing table
    pub fn remove(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let idx = self.bucket_index(node_id)?;
        self.buckets[idx].remove(node_id)
    }

    /// The `k` known nodes closest to `target`, nearest first
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<NodeInfo> {
        let mut all_nodes = self.get_all_nodes();
        all_nodes.sort_by_key(|node| target.distance(node.node_id()));
        all_nodes.truncate(k);
        all_nodes
    }

    /// Wire form of [`find_closest`](Self::find_closest)
    pub fn find_closest_peers(&self, target: &NodeId, k: usize) -> Vec<PeerInfo> {
        self.find_closest(target, k)
            .iter()
            .map(NodeInfo::to_peer_info)
            .collect()
    }

    /// Nodes in any bucket not heard from within `max_age_secs`
    pub fn silent_nodes(&self, max_age_secs: u64) -> Vec<PeerInfo> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.silent_nodes(max_age_secs))
            .collect()
    }

    /// Get buckets that need refreshing
    pub fn get_stale_buckets(&self, max_age_secs: u64) -> Vec<usize> {
        let current_time = now();
        self.buckets
            .iter()
            .filter(|bucket| {
                !bucket.is_empty() && current_time.saturating_sub(bucket.last_updated) > max_age_secs
            })
            .map(|bucket| bucket.index)
            .collect()
    }

    /// A random id that falls into bucket `index`, used as a refresh target
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let mut bytes = *self.local_node_id.as_bytes();
        let index = index.min(NUM_BUCKETS - 1);
        let byte_idx = index / 8;
        let bit = 7 - (index % 8);

        // Flip the first differing bit, randomize everything after it
        bytes[byte_idx] ^= 1 << bit;
        let mut rng = rand::thread_rng();
        let low_mask: u8 = (1u16 << bit).wrapping_sub(1) as u8;
        bytes[byte_idx] = (bytes[byte_idx] & !low_mask) | (rng.gen::<u8>() & low_mask);
        for byte in bytes.iter_mut().take(NODE_ID_SIZE).skip(byte_idx + 1) {
            *byte = rng.gen();
        }

        NodeId::from_bytes(bytes)
    }

    /// Get all nodes in routing table
    pub fn get_all_nodes(&self) -> Vec<NodeInfo> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter().cloned())
            .collect()
    }

    /// Get bucket by index
    pub fn get_bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_info::test_support::{create_test_peer, create_test_peer_with_id};
    use crate::{K, MAX_PROBE_FAILURES};

    fn id_with_first_byte(value: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[0] = value;
        NodeId::from_bytes(bytes)
    }

    fn zero_table() -> RoutingTable {
        RoutingTable::new(NodeId::from_bytes([0; NODE_ID_SIZE]))
    }

    #[test]
    fn test_new_routing_table() {
        let local_id = NodeId::from_bytes([0; NODE_ID_SIZE]);
        let table = RoutingTable::new(local_id);

        assert_eq!(table.node_count(), 0);
        assert_eq!(table.local_node_id(), &local_id);
        assert!(table.get_bucket(NUM_BUCKETS - 1).is_some());
        assert!(table.get_bucket(NUM_BUCKETS).is_none());
    }

    #[test]
    fn test_add_node() {
        let mut table = zero_table();
        let peer = create_test_peer(1);
        assert_eq!(table.add_or_update(peer.clone()), InsertOutcome::Added);

        assert_eq!(table.node_count(), 1);
        assert!(table.find_node(&peer.node_id).is_some());
    }

    #[test]
    fn test_dont_add_self() {
        let mut table = zero_table();
        let self_peer = create_test_peer(0);
        assert_eq!(table.add_or_update(self_peer), InsertOutcome::Ignored);
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_no_duplicates() {
        let mut table = zero_table();
        table.add_or_update(create_test_peer(1));
        table.add_or_update(create_test_peer(1));
        assert_eq!(table.node_count(), 1);
    }

    #[test]
    fn test_bucket_index() {
        let table = zero_table();
        assert_eq!(table.bucket_index(&id_with_first_byte(0x80)), Some(0));
        assert_eq!(table.bucket_index(&id_with_first_byte(0x01)), Some(7));

        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[NODE_ID_SIZE - 1] = 1;
        assert_eq!(table.bucket_index(&NodeId::from_bytes(bytes)), Some(159));
        assert_eq!(table.bucket_index(table.local_node_id()), None);
    }

    #[test]
    fn test_find_closest_sorted_ascending() {
        let mut table = zero_table();
        for value in [0x80u8, 0x01, 0x40, 0x03, 0x10, 0xFF] {
            table.add_or_update(create_test_peer_with_id(id_with_first_byte(value)));
        }

        let target = id_with_first_byte(0x02);
        let closest = table.find_closest(&target, 4);
        let firsts: Vec<u8> = closest.iter().map(|n| n.node_id().as_bytes()[0]).collect();
        assert_eq!(firsts, vec![0x03, 0x01, 0x10, 0x40]);

        for pair in closest.windows(2) {
            assert!(target.distance(pair[0].node_id()) < target.distance(pair[1].node_id()));
        }
    }

    #[test]
    fn test_find_closest_bounded_by_known_nodes() {
        let mut table = zero_table();
        table.add_or_update(create_test_peer(1));
        table.add_or_update(create_test_peer(2));
        assert_eq!(table.find_closest(&id_with_first_byte(9), K).len(), 2);
    }

    #[test]
    fn test_full_bucket_keeps_responsive_node() {
        let mut table = zero_table();
        // All ids with top bit set land in bucket 0
        for i in 0..K as u8 {
            table.add_or_update(create_test_peer_with_id(id_with_first_byte(0x80 | i)));
        }
        let newcomer = create_test_peer_with_id(id_with_first_byte(0xF0));
        let probe = match table.add_or_update(newcomer.clone()) {
            InsertOutcome::Full { probe } => probe,
            other => panic!("expected Full, got {:?}", other),
        };

        assert!(table.record_success(&probe.node_id, 2.0));
        assert!(table.find_node(&probe.node_id).is_some());
        assert!(table.find_node(&newcomer.node_id).is_none());
        assert_eq!(table.node_count(), K);
    }

    #[test]
    fn test_full_bucket_evicts_dead_node() {
        let mut table = zero_table();
        for i in 0..K as u8 {
            table.add_or_update(create_test_peer_with_id(id_with_first_byte(0x80 | i)));
        }
        let newcomer = create_test_peer_with_id(id_with_first_byte(0xF0));
        let InsertOutcome::Full { probe } = table.add_or_update(newcomer.clone()) else {
            panic!("expected full bucket");
        };

        for _ in 0..MAX_PROBE_FAILURES {
            table.record_failure(&probe.node_id);
        }
        assert!(table.find_node(&probe.node_id).is_none());
        assert!(table.find_node(&newcomer.node_id).is_some());
    }

    #[test]
    fn test_random_id_in_bucket() {
        let table = RoutingTable::new(NodeId::from_bytes([0x5A; NODE_ID_SIZE]));
        for index in [0usize, 7, 8, 63, 159] {
            let id = table.random_id_in_bucket(index);
            assert_eq!(table.bucket_index(&id), Some(index));
        }
    }

    #[test]
    fn test_get_stale_buckets() {
        let mut table = zero_table();
        table.add_or_update(create_test_peer(1));
        assert!(table.get_stale_buckets(3600).is_empty());
    }
}
