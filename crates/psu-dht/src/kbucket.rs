//! K-bucket implementation for Kademlia DHT
//!
//! Nodes are ordered least-recently-seen first. When a bucket is full a new
//! node waits in the replacement cache while the head is probed; the head is
//! only evicted after repeated probe failures.

use crate::node_info::NodeInfo;
use crate::{K, MAX_PROBE_FAILURES};
use psu_protocol::{NodeId, PeerInfo};
use std::collections::VecDeque;

/// Result of offering a node to a bucket
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Node was already present and moved to most-recently-seen
    Updated,
    /// Node was added to a bucket with free space
    Added,
    /// Bucket is full; the node was cached and `probe` should be pinged
    Full { probe: PeerInfo },
    /// Bucket is full and the node was already cached; no new probe needed
    Cached,
    /// Node is the local node
    Ignored,
}

/// Result of recording a failure against a bucket entry
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Failure counted, node kept
    Marked { failures: u32 },
    /// Node evicted; a cached candidate may have taken its slot
    Evicted { promoted: Option<NodeId> },
    /// Node not in the bucket
    Unknown,
}

/// A k-bucket for storing nodes at a specific distance
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Bucket index (common prefix length with the local id)
    pub index: usize,

    /// Nodes in this bucket (up to k nodes), least recently seen first
    nodes: VecDeque<NodeInfo>,

    /// Replacement cache for when bucket is full
    replacement_cache: VecDeque<NodeInfo>,

    /// Last time this bucket was updated
    pub last_updated: u64,
}

impl KBucket {
    /// Create a new k-bucket
    pub fn new(index: usize) -> Self {
        KBucket {
            index,
            nodes: VecDeque::with_capacity(K),
            replacement_cache: VecDeque::with_capacity(K),
            last_updated: 0,
        }
    }

    /// Get number of nodes in bucket
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if bucket is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    /// Get all nodes in bucket
    pub fn nodes(&self) -> &VecDeque<NodeInfo> {
        &self.nodes
    }

    /// Find node by ID
    pub fn find_node(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.node_id() == node_id)
    }

    /// Find node mutably
    pub fn find_node_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeInfo> {
        self.nodes.iter_mut().find(|n| n.node_id() == node_id)
    }

    /// Least recently seen node, the eviction candidate
    pub fn least_recently_seen(&self) -> Option<&NodeInfo> {
        self.nodes.front()
    }

    /// Add or update a node in the bucket
    pub fn add_or_update(&mut self, peer: PeerInfo, current_time: u64) -> InsertOutcome {
        let node_id = peer.node_id;

        // Existing node moves to the back (most recently seen)
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id() == &node_id) {
            if let Some(mut existing) = self.nodes.remove(pos) {
                existing.refresh(peer);
                self.nodes.push_back(existing);
            }
            self.last_updated = current_time;
            return InsertOutcome::Updated;
        }

        if !self.is_full() {
            self.remove_from_cache(&node_id);
            self.nodes.push_back(NodeInfo::new(peer));
            self.last_updated = current_time;
            return InsertOutcome::Added;
        }

        let already_cached = self.replacement_cache.iter().any(|n| n.node_id() == &node_id);
        self.add_to_replacement_cache(NodeInfo::new(peer));
        if already_cached {
            return InsertOutcome::Cached;
        }
        match self.nodes.front() {
            Some(head) => InsertOutcome::Full {
                probe: head.to_peer_info(),
            },
            None => InsertOutcome::Ignored,
        }
    }

    /// Mark a node as alive, moving it to most-recently-seen
    ///
    /// Returns false if the node is not in the bucket.
    pub fn record_success(&mut self, node_id: &NodeId, rtt_ms: f64, current_time: u64) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| n.node_id() == node_id) else {
            return false;
        };
        if let Some(mut node) = self.nodes.remove(pos) {
            node.record_success(rtt_ms);
            self.nodes.push_back(node);
            self.last_updated = current_time;
        }
        true
    }

    /// Count a failed exchange, evicting after `MAX_PROBE_FAILURES`
    pub fn record_failure(&mut self, node_id: &NodeId) -> FailureOutcome {
        let Some(node) = self.find_node_mut(node_id) else {
            return FailureOutcome::Unknown;
        };
        node.record_failure();
        let failures = node.failures;

        if failures >= MAX_PROBE_FAILURES {
            let (_, promoted) = self.evict(node_id);
            FailureOutcome::Evicted { promoted }
        } else {
            FailureOutcome::Marked { failures }
        }
    }

    /// Add node to replacement cache
    fn add_to_replacement_cache(&mut self, node: NodeInfo) {
        self.remove_from_cache(node.node_id());
        self.replacement_cache.push_back(node);

        // Limit cache size
        if self.replacement_cache.len() > K {
            self.replacement_cache.pop_front();
        }
    }

    fn remove_from_cache(&mut self, node_id: &NodeId) {
        self.replacement_cache.retain(|n| n.node_id() != node_id);
    }

    /// Remove a node and promote the most recently cached candidate
    fn evict(&mut self, node_id: &NodeId) -> (Option<NodeInfo>, Option<NodeId>) {
        let Some(pos) = self.nodes.iter().position(|n| n.node_id() == node_id) else {
            return (None, None);
        };
        let removed = self.nodes.remove(pos);

        let promoted = self.replacement_cache.pop_back().map(|replacement| {
            let id = *replacement.node_id();
            self.nodes.push_back(replacement);
            id
        });

        (removed, promoted)
    }

    /// Remove a node from the bucket
    pub fn remove(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        self.evict(node_id).0
    }

    /// Nodes not heard from within `max_age_secs`, due a liveness probe
    pub fn silent_nodes(&self, max_age_secs: u64) -> Vec<PeerInfo> {
        self.nodes
            .iter()
            .filter(|node| node.is_older_than(max_age_secs))
            .map(NodeInfo::to_peer_info)
            .collect()
    }

    /// Get replacement cache
    pub fn replacement_cache(&self) -> &VecDeque<NodeInfo> {
        &self.replacement_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_info::test_support::{create_test_node, create_test_peer};
    use psu_crypto::NODE_ID_SIZE;

    fn full_bucket() -> KBucket {
        let mut bucket = KBucket::new(0);
        for i in 0..K {
            bucket.add_or_update(create_test_peer(i as u8), 0);
        }
        bucket
    }

    #[test]
    fn test_empty_bucket() {
        let bucket = KBucket::new(0);
        assert!(bucket.is_empty());
        assert!(!bucket.is_full());
        assert_eq!(bucket.len(), 0);
    }

    #[test]
    fn test_add_node() {
        let mut bucket = KBucket::new(0);
        assert_eq!(
            bucket.add_or_update(create_test_peer(1), 0),
            InsertOutcome::Added
        );
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn test_update_existing_node_moves_to_back() {
        let mut bucket = KBucket::new(0);
        bucket.add_or_update(create_test_peer(1), 0);
        bucket.add_or_update(create_test_peer(2), 0);

        assert_eq!(
            bucket.add_or_update(create_test_peer(1), 5),
            InsertOutcome::Updated
        );
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.last_updated, 5);
        assert_eq!(bucket.nodes().back().unwrap().node_id(), &create_test_peer(1).node_id);
    }

    #[test]
    fn test_full_bucket_requests_probe_of_head() {
        let mut bucket = full_bucket();
        assert!(bucket.is_full());

        let outcome = bucket.add_or_update(create_test_peer(99), 0);
        match outcome {
            InsertOutcome::Full { probe } => {
                assert_eq!(probe.node_id, create_test_peer(0).node_id);
            }
            other => panic!("expected Full, got {:?}", other),
        }
        assert_eq!(bucket.len(), K);
        assert_eq!(bucket.replacement_cache().len(), 1);
    }

    #[test]
    fn test_successful_probe_keeps_head() {
        let mut bucket = full_bucket();
        let head = create_test_peer(0).node_id;
        bucket.add_or_update(create_test_peer(99), 0);

        assert!(bucket.record_success(&head, 3.0, 1));

        assert!(bucket.find_node(&head).is_some());
        assert_eq!(bucket.nodes().back().unwrap().node_id(), &head);
        assert!(bucket.find_node(&create_test_peer(99).node_id).is_none());
        assert_eq!(bucket.replacement_cache().len(), 1);
    }

    #[test]
    fn test_repeated_failures_evict_and_promote() {
        let mut bucket = full_bucket();
        let head = create_test_peer(0).node_id;
        let candidate = create_test_peer(99).node_id;
        bucket.add_or_update(create_test_peer(99), 0);

        for expected in 1..MAX_PROBE_FAILURES {
            assert_eq!(
                bucket.record_failure(&head),
                FailureOutcome::Marked { failures: expected }
            );
            assert!(bucket.find_node(&head).unwrap().stale);
        }

        assert_eq!(
            bucket.record_failure(&head),
            FailureOutcome::Evicted {
                promoted: Some(candidate)
            }
        );
        assert!(bucket.find_node(&head).is_none());
        assert!(bucket.find_node(&candidate).is_some());
        assert_eq!(bucket.len(), K);
    }

    #[test]
    fn test_failure_for_unknown_node() {
        let mut bucket = KBucket::new(0);
        assert_eq!(
            bucket.record_failure(&NodeId::from_bytes([5; NODE_ID_SIZE])),
            FailureOutcome::Unknown
        );
    }

    #[test]
    fn test_remove_node() {
        let mut bucket = KBucket::new(0);
        let node = create_test_node(1);
        bucket.add_or_update(node.peer.clone(), 0);

        assert!(bucket.remove(node.node_id()).is_some());
        assert_eq!(bucket.len(), 0);
    }

    #[test]
    fn test_silent_nodes_are_reported_not_removed() {
        let mut bucket = KBucket::new(0);
        bucket.add_or_update(create_test_peer(1), 0);
        bucket.add_or_update(create_test_peer(2), 0);
        bucket
            .find_node_mut(&create_test_peer(1).node_id)
            .unwrap()
            .last_seen = 0;

        let silent = bucket.silent_nodes(3600);
        assert_eq!(silent.len(), 1);
        assert_eq!(silent[0].node_id, create_test_peer(1).node_id);
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_cached_node_leaves_head_alone() {
        let mut bucket = full_bucket();
        assert!(matches!(
            bucket.add_or_update(create_test_peer(99), 0),
            InsertOutcome::Full { .. }
        ));
        for _ in 0..10 {
            assert_eq!(bucket.add_or_update(create_test_peer(99), 0), InsertOutcome::Cached);
        }
        assert_eq!(bucket.replacement_cache().len(), 1);
    }

    #[test]
    fn test_replacement_cache_fills_bucket() {
        let mut bucket = full_bucket();
        bucket.add_or_update(create_test_peer(99), 0);

        let first = *bucket.nodes().front().unwrap().node_id();
        bucket.remove(&first);

        assert_eq!(bucket.len(), K);
        assert_eq!(bucket.replacement_cache().len(), 0);
    }
}
