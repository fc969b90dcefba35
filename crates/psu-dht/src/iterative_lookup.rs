//! Iterative DHT lookup state
//!
//! Tracks the candidate set of an iterative FIND_NODE / FIND_VALUE following
//! the Kademlia algorithm. The network side lives in
//! [`DhtService`](crate::dht::DhtService); this module only decides which
//! nodes to query next and when the lookup has converged.

use crate::{ALPHA, K};
use psu_crypto::NODE_ID_SIZE;
use psu_protocol::{NodeId, PeerInfo};
use std::collections::HashMap;

/// Default cap on lookup rounds
pub const DEFAULT_MAX_ROUNDS: usize = 10;

/// State of a node in the lookup process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// Node has not been queried yet
    Pending,

    /// Query sent, awaiting response
    Queried,

    /// Response received successfully
    Responded,

    /// Query failed or timed out
    Failed,
}

/// Tracks a candidate node during lookup
#[derive(Debug, Clone)]
struct LookupCandidate {
    node: PeerInfo,
    state: NodeState,
    distance: [u8; NODE_ID_SIZE],
}

/// Manages iterative lookup state
#[derive(Debug)]
pub struct IterativeLookup {
    /// Target we're looking for (node ID or key hash)
    target: NodeId,

    /// Node performing the lookup; never becomes a candidate
    local_node_id: NodeId,

    candidates: HashMap<NodeId, LookupCandidate>,

    /// k value (number of closest nodes to find)
    k: usize,

    /// alpha value (parallel query concurrency)
    alpha: usize,

    /// Maximum number of rounds before giving up
    max_rounds: usize,

    current_round: usize,

    /// Total queries the lookup may issue
    max_queries: usize,

    queries_sent: usize,
}

impl IterativeLookup {
    /// Create a new iterative lookup
    pub fn new(target: NodeId, local_node_id: NodeId, initial_nodes: Vec<PeerInfo>) -> Self {
        Self::with_params(
            target,
            local_node_id,
            initial_nodes,
            K,
            ALPHA,
            DEFAULT_MAX_ROUNDS,
        )
    }

    /// Create with custom parameters
    pub fn with_params(
        target: NodeId,
        local_node_id: NodeId,
        initial_nodes: Vec<PeerInfo>,
        k: usize,
        alpha: usize,
        max_rounds: usize,
    ) -> Self {
        let mut lookup = IterativeLookup {
            target,
            local_node_id,
            candidates: HashMap::new(),
            k: k.max(1),
            alpha: alpha.max(1),
            max_rounds,
            current_round: 0,
            max_queries: max_rounds.saturating_mul(alpha.max(1)),
            queries_sent: 0,
        };
        lookup.add_discovered_nodes(initial_nodes);
        lookup
    }

    /// Override the total query budget
    pub fn with_max_queries(mut self, max_queries: usize) -> Self {
        self.max_queries = max_queries;
        self
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Get the next batch of nodes to query (up to alpha nodes)
    pub fn next_query_batch(&mut self) -> Vec<PeerInfo> {
        let budget = self.max_queries.saturating_sub(self.queries_sent);

        // Pending nodes sorted by distance
        let mut pending: Vec<&LookupCandidate> = self
            .candidates
            .values()
            .filter(|c| c.state == NodeState::Pending)
            .collect();
        pending.sort_by(|a, b| a.distance.cmp(&b.distance));

        let batch: Vec<PeerInfo> = pending
            .iter()
            .take(self.alpha.min(budget))
            .map(|c| c.node.clone())
            .collect();

        for node in &batch {
            if let Some(candidate) = self.candidates.get_mut(&node.node_id) {
                candidate.state = NodeState::Queried;
            }
        }
        self.queries_sent += batch.len();

        batch
    }

    /// Add newly discovered nodes from a response
    pub fn add_discovered_nodes(&mut self, nodes: Vec<PeerInfo>) {
        for node in nodes {
            if node.node_id == self.local_node_id || self.candidates.contains_key(&node.node_id)
            {
                continue;
            }

            let distance = self.target.distance(&node.node_id);
            self.candidates.insert(
                node.node_id,
                LookupCandidate {
                    node,
                    state: NodeState::Pending,
                    distance,
                },
            );
        }
    }

    /// Mark a node as responded successfully
    pub fn mark_responded(&mut self, node_id: &NodeId) {
        if let Some(candidate) = self.candidates.get_mut(node_id) {
            candidate.state = NodeState::Responded;
        }
    }

    /// Mark a node as failed
    pub fn mark_failed(&mut self, node_id: &NodeId) {
        if let Some(candidate) = self.candidates.get_mut(node_id) {
            candidate.state = NodeState::Failed;
        }
    }

    fn count(&self, state: NodeState) -> usize {
        self.candidates.values().filter(|c| c.state == state).count()
    }

    /// Check if the lookup is complete
    ///
    /// A lookup ends when the round or query budget is spent, when nothing is
    /// left to query, or when the k closest responders are all closer than
    /// every pending candidate.
    pub fn is_complete(&self) -> bool {
        if self.current_round >= self.max_rounds || self.queries_sent >= self.max_queries {
            return true;
        }

        let has_pending = self.count(NodeState::Pending) > 0;
        let has_queried = self.count(NodeState::Queried) > 0;
        if !has_pending && !has_queried {
            return true;
        }

        let mut responded: Vec<&LookupCandidate> = self
            .candidates
            .values()
            .filter(|c| c.state == NodeState::Responded)
            .collect();

        if responded.len() >= self.k {
            responded.sort_by(|a, b| a.distance.cmp(&b.distance));
            let kth_distance = &responded[self.k - 1].distance;

            let all_pending_farther = self
                .candidates
                .values()
                .filter(|c| c.state == NodeState::Pending)
                .all(|c| &c.distance > kth_distance);

            if all_pending_farther {
                return true;
            }
        }

        false
    }

    /// Advance to the next round
    pub fn next_round(&mut self) {
        self.current_round += 1;
    }

    /// Get the k closest nodes that responded, nearest first
    pub fn get_closest_nodes(&self) -> Vec<PeerInfo> {
        let mut responded: Vec<&LookupCandidate> = self
            .candidates
            .values()
            .filter(|c| c.state == NodeState::Responded)
            .collect();

        responded.sort_by(|a, b| a.distance.cmp(&b.distance));

        responded
            .iter()
            .take(self.k)
            .map(|c| c.node.clone())
            .collect()
    }

    /// Get statistics about the lookup
    pub fn stats(&self) -> LookupStats {
        LookupStats {
            total_candidates: self.candidates.len(),
            pending: self.count(NodeState::Pending),
            queried: self.count(NodeState::Queried),
            responded: self.count(NodeState::Responded),
            failed: self.count(NodeState::Failed),
            current_round: self.current_round,
            queries_sent: self.queries_sent,
        }
    }
}

/// Statistics about a lookup operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub total_candidates: usize,
    pub pending: usize,
    pub queried: usize,
    pub responded: usize,
    pub failed: usize,
    pub current_round: usize,
    pub queries_sent: usize,
}
