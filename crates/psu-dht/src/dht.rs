//! High-level DHT service coordinator
//!
//! This module provides the async runtime integration for DHT operations:
//! iterative FIND_NODE, replicated STORE, FIND_VALUE, PING, liveness probing
//! of full buckets and periodic maintenance.

use crate::error::{DhtError, Result};
use crate::iterative_lookup::{IterativeLookup, DEFAULT_MAX_ROUNDS};
use crate::kbucket::{FailureOutcome, InsertOutcome};
use crate::operations::{FindValueResult, StoreReport};
use crate::request_handler::DhtRequestHandler;
use crate::routing_table::RoutingTable;
use crate::storage::{clamp_ttl, DhtRecord, DhtStorage};
use crate::{ALPHA, K, MAX_PROBE_FAILURES, MAX_VALUE_SIZE};
use psu_crypto::hashing::key_to_node_id;
use psu_protocol::payload::{
    DhtFindNode, DhtFindNodeResponse, DhtFindValue, DhtFindValueResponse, DhtPing,
    DhtPingResponse, DhtStore, DhtStoreResponse,
};
use psu_protocol::{NodeId, Payload, PeerInfo};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Transport abstraction for DHT RPC calls
///
/// This allows the DHT to send queries without being coupled to the
/// network layer implementation.
#[async_trait::async_trait]
pub trait DhtTransport: Send + Sync {
    /// Send a FIND_NODE request and await response
    async fn find_node(&self, peer: &PeerInfo, request: DhtFindNode)
        -> Result<DhtFindNodeResponse>;

    /// Send a FIND_VALUE request and await response
    async fn find_value(
        &self,
        peer: &PeerInfo,
        request: DhtFindValue,
    ) -> Result<DhtFindValueResponse>;

    /// Send a STORE request and await acknowledgment
    async fn store(&self, peer: &PeerInfo, request: DhtStore) -> Result<DhtStoreResponse>;

    /// Send a PING request and await response
    async fn ping(&self, peer: &PeerInfo, request: DhtPing) -> Result<DhtPingResponse>;
}

/// Tunables for the DHT service
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size and number of closest nodes tracked by lookups
    pub k: usize,
    /// Parallel queries per lookup round
    pub alpha: usize,
    /// Timeout for a single RPC
    pub query_timeout: Duration,
    /// Maximum rounds of a lookup
    pub max_lookup_rounds: usize,
    /// Maximum RPCs a single lookup may issue
    pub max_lookup_queries: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            k: K,
            alpha: ALPHA,
            query_timeout: Duration::from_secs(5),
            max_lookup_rounds: DEFAULT_MAX_ROUNDS,
            max_lookup_queries: DEFAULT_MAX_ROUNDS * ALPHA,
        }
    }
}

/// DHT Service provides high-level DHT operations
pub struct DhtService {
    /// Our own advertisement
    local: PeerInfo,

    config: DhtConfig,

    /// Routing table
    routing_table: Arc<RwLock<RoutingTable>>,

    /// Local DHT storage
    storage: Arc<RwLock<DhtStorage>>,

    /// Computes responses to incoming requests
    handler: DhtRequestHandler,

    /// RPC transport for DHT queries
    transport: Arc<dyn DhtTransport>,

    prober: Prober,
}

/// Run a transport call under the query timeout
async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DhtError::QueryTimeout),
    }
}

/// Liveness prober shared by the service and its background tasks
///
/// At most one probe per node runs at a time.
#[derive(Clone)]
struct Prober {
    routing_table: Arc<RwLock<RoutingTable>>,
    transport: Arc<dyn DhtTransport>,
    local: PeerInfo,
    query_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<NodeId>>>,
}

impl Prober {
    /// Probe `target` unless a probe of it is already running
    ///
    /// Returns `None` when skipped, otherwise whether the node was kept.
    async fn probe_once(&self, target: PeerInfo) -> Option<bool> {
        if !self.in_flight.lock().await.insert(target.node_id) {
            debug!("Probe of {} already in flight", target.node_id);
            return None;
        }
        let kept = self.probe_until_decided(&target).await;
        self.in_flight.lock().await.remove(&target.node_id);
        Some(kept)
    }

    /// Ping `target` until it answers or has failed `MAX_PROBE_FAILURES` times
    async fn probe_until_decided(&self, target: &PeerInfo) -> bool {
        for attempt in 1..=MAX_PROBE_FAILURES {
            let started = Instant::now();
            let request = DhtPing {
                sender: self.local.clone(),
            };
            match with_timeout(self.query_timeout, self.transport.ping(target, request)).await {
                Ok(_) => {
                    let rtt = started.elapsed().as_secs_f64() * 1000.0;
                    self.routing_table
                        .write()
                        .await
                        .record_success(&target.node_id, rtt);
                    debug!("Probe of {} succeeded on attempt {}", target.node_id, attempt);
                    return true;
                }
                Err(e) => {
                    let outcome = self.routing_table.write().await.record_failure(&target.node_id);
                    debug!(
                        "Probe {} of {} failed: {} ({:?})",
                        attempt, target.node_id, e, outcome
                    );
                    match outcome {
                        FailureOutcome::Marked { .. } => continue,
                        FailureOutcome::Evicted { .. } | FailureOutcome::Unknown => return false,
                    }
                }
            }
        }
        false
    }
}

impl DhtService {
    /// Create a new DHT service with empty routing table and storage
    pub fn new(local: PeerInfo, config: DhtConfig, transport: Arc<dyn DhtTransport>) -> Self {
        let routing_table = Arc::new(RwLock::new(RoutingTable::new(local.node_id)));
        let storage = Arc::new(RwLock::new(DhtStorage::new()));
        Self::with_components(local, config, routing_table, storage, transport)
    }

    /// Create a DHT service over existing components
    pub fn with_components(
        local: PeerInfo,
        config: DhtConfig,
        routing_table: Arc<RwLock<RoutingTable>>,
        storage: Arc<RwLock<DhtStorage>>,
        transport: Arc<dyn DhtTransport>,
    ) -> Self {
        let handler =
            DhtRequestHandler::new(local.clone(), routing_table.clone(), storage.clone())
                .with_k(config.k);
        let prober = Prober {
            routing_table: routing_table.clone(),
            transport: transport.clone(),
            local: local.clone(),
            query_timeout: config.query_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        Self {
            local,
            config,
            routing_table,
            storage,
            handler,
            transport,
            prober,
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local.node_id
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Learn about a peer that contacted us or answered us
    ///
    /// When its bucket is full the least recently seen entry is probed in the
    /// background; the newcomer waits in the replacement cache meanwhile.
    pub async fn observe(&self, peer: PeerInfo) {
        let outcome = self.routing_table.write().await.add_or_update(peer);
        if let InsertOutcome::Full { probe } = outcome {
            let prober = self.prober.clone();
            tokio::spawn(async move {
                prober.probe_once(probe).await;
            });
        }
    }

    /// Probe a node until it answers or is evicted
    ///
    /// Returns true if the node answered. A node already being probed is
    /// reported as kept while the running probe decides.
    pub async fn probe(&self, target: PeerInfo) -> bool {
        self.prober.probe_once(target).await.unwrap_or(true)
    }

    /// Handle an incoming DHT request
    ///
    /// The requester is added to (or refreshed in) the routing table before
    /// the response is computed.
    pub async fn handle_request(&self, request: &Payload) -> Result<Payload> {
        let sender = match request {
            Payload::DhtFindNode(req) => &req.sender,
            Payload::DhtFindValue(req) => &req.sender,
            Payload::DhtStore(req) => &req.sender,
            Payload::DhtPing(req) => &req.sender,
            other => return Err(DhtError::UnexpectedMessage(other.message_type())),
        };
        self.observe(sender.clone()).await;
        self.handler.handle(request).await
    }

    /// Ping a peer, updating its liveness
    pub async fn ping(&self, peer: &PeerInfo) -> Result<DhtPingResponse> {
        let started = Instant::now();
        let request = DhtPing {
            sender: self.local.clone(),
        };
        match with_timeout(self.config.query_timeout, self.transport.ping(peer, request)).await {
            Ok(response) => {
                self.record_response(&response.sender, started).await;
                Ok(response)
            }
            Err(e) => {
                self.routing_table.write().await.record_failure(&peer.node_id);
                Err(e)
            }
        }
    }

    /// Refresh a responder in its bucket
    async fn record_response(&self, responder: &PeerInfo, started: Instant) {
        self.observe(responder.clone()).await;
        let rtt = started.elapsed().as_secs_f64() * 1000.0;
        self.routing_table
            .write()
            .await
            .record_success(&responder.node_id, rtt);
    }

    /// Query a single node for FIND_NODE
    async fn query_find_node(&self, target: &NodeId, peer: &PeerInfo) -> Result<DhtFindNodeResponse> {
        let request = DhtFindNode {
            sender: self.local.clone(),
            target: *target,
            max_nodes: self.config.k as u32,
        };
        with_timeout(self.config.query_timeout, self.transport.find_node(peer, request)).await
    }

    /// Query a single node for FIND_VALUE
    async fn query_find_value(&self, key: &str, peer: &PeerInfo) -> Result<DhtFindValueResponse> {
        let request = DhtFindValue {
            sender: self.local.clone(),
            key: key.to_string(),
        };
        with_timeout(self.config.query_timeout, self.transport.find_value(peer, request)).await
    }

    fn new_lookup(&self, target: NodeId, initial_nodes: Vec<PeerInfo>) -> IterativeLookup {
        IterativeLookup::with_params(
            target,
            self.local.node_id,
            initial_nodes,
            self.config.k,
            self.config.alpha,
            self.config.max_lookup_rounds,
        )
        .with_max_queries(self.config.max_lookup_queries)
    }

    /// Perform an iterative FIND_NODE lookup
    ///
    /// Returns up to k closest responsive nodes to the target, nearest first.
    ///
    /// # Algorithm (Kademlia)
    /// 1. Start with k closest nodes from local routing table
    /// 2. Query alpha closest unqueried nodes in parallel
    /// 3. Add returned nodes to candidate set
    /// 4. Repeat until we have k responded nodes closer than any pending
    /// 5. Return k closest responded nodes
    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<PeerInfo>> {
        debug!("Starting iterative_find_node for target {}", target);

        let initial_nodes = {
            let rt = self.routing_table.read().await;
            rt.find_closest_peers(&target, self.config.k)
        };

        if initial_nodes.is_empty() {
            warn!("No initial nodes in routing table for lookup");
            return Err(DhtError::NoKnownNodes);
        }

        let mut lookup = self.new_lookup(target, initial_nodes);

        while !lookup.is_complete() {
            let batch = lookup.next_query_batch();
            if batch.is_empty() {
                break;
            }

            let started = Instant::now();
            let results = futures::future::join_all(
                batch.iter().map(|node| self.query_find_node(&target, node)),
            )
            .await;

            for (node, result) in batch.iter().zip(results) {
                match result {
                    Ok(response) => {
                        debug!(
                            "Node {} responded with {} nodes",
                            node.node_id,
                            response.nodes.len()
                        );
                        lookup.mark_responded(&node.node_id);
                        lookup.add_discovered_nodes(response.nodes);
                        self.record_response(&response.sender, started).await;
                    }
                    Err(e) => {
                        debug!("Node {} query failed: {}", node.node_id, e);
                        lookup.mark_failed(&node.node_id);
                        self.routing_table.write().await.record_failure(&node.node_id);
                    }
                }
            }

            lookup.next_round();

            let stats = lookup.stats();
            debug!(
                "Round {}: {} total, {} pending, {} responded, {} failed, {} queries",
                stats.current_round,
                stats.total_candidates,
                stats.pending,
                stats.responded,
                stats.failed,
                stats.queries_sent
            );
        }

        let closest = lookup.get_closest_nodes();
        info!(
            "iterative_find_node for {} complete: found {} nodes",
            target,
            closest.len()
        );
        Ok(closest)
    }

    /// Perform an iterative FIND_VALUE lookup
    ///
    /// Local storage is checked first. Otherwise increasingly closer nodes
    /// are queried until one returns the value, the lookup converges, or the
    /// query budget is spent.
    pub async fn find_value(&self, key: &str) -> Result<FindValueResult> {
        if key.is_empty() {
            return Err(DhtError::InvalidKey("key must not be empty".to_string()));
        }

        {
            let storage = self.storage.read().await;
            if let Some(record) = storage.get(key) {
                debug!("Value for {} found in local storage", key);
                return Ok(FindValueResult::Found {
                    value: record.value.clone(),
                    expiration_time: Some(record.expires_at),
                    holder: None,
                });
            }
        }

        let target = key_to_node_id(key);
        let initial_nodes = {
            let rt = self.routing_table.read().await;
            rt.find_closest_peers(&target, self.config.k)
        };

        if initial_nodes.is_empty() {
            debug!("No known nodes to ask for {}", key);
            return Ok(FindValueResult::NotFound {
                closest: Vec::new(),
            });
        }

        let mut lookup = self.new_lookup(target, initial_nodes);

        while !lookup.is_complete() {
            let batch = lookup.next_query_batch();
            if batch.is_empty() {
                break;
            }

            let started = Instant::now();
            let results = futures::future::join_all(
                batch.iter().map(|node| self.query_find_value(key, node)),
            )
            .await;

            for (node, result) in batch.iter().zip(results) {
                match result {
                    Ok(response) => {
                        lookup.mark_responded(&node.node_id);
                        self.record_response(&response.sender, started).await;

                        if let Some(value) = response.value {
                            info!("Value for {} found at {}", key, node.node_id);
                            return Ok(FindValueResult::Found {
                                value,
                                expiration_time: response.expiration_time,
                                holder: Some(node.node_id),
                            });
                        }

                        debug!(
                            "Node {} doesn't have {}, returned {} closer nodes",
                            node.node_id,
                            key,
                            response.nodes.len()
                        );
                        lookup.add_discovered_nodes(response.nodes);
                    }
                    Err(e) => {
                        debug!("Node {} query failed: {}", node.node_id, e);
                        lookup.mark_failed(&node.node_id);
                        self.routing_table.write().await.record_failure(&node.node_id);
                    }
                }
            }

            lookup.next_round();
        }

        let closest = lookup.get_closest_nodes();
        info!(
            "find_value for {}: not found, returning {} closest nodes",
            key,
            closest.len()
        );
        Ok(FindValueResult::NotFound { closest })
    }

    /// Store a value on the `replication_factor` nodes closest to `hash(key)`
    ///
    /// TTL is clamped to 24 hours. Succeeds when at least one node (the local
    /// node included) holds the record afterwards.
    pub async fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u32,
        replication_factor: u32,
    ) -> Result<StoreReport> {
        if replication_factor == 0 {
            return Err(DhtError::InvalidReplicationFactor(replication_factor));
        }
        if key.is_empty() {
            return Err(DhtError::InvalidKey("key must not be empty".to_string()));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(DhtError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        let ttl_secs = clamp_ttl(ttl_secs) as u32;

        let target = key_to_node_id(key);
        let closest = match self.iterative_find_node(target).await {
            Ok(nodes) => nodes,
            Err(DhtError::NoKnownNodes) => Vec::new(),
            Err(e) => return Err(e),
        };
        let replicas: Vec<PeerInfo> = closest
            .iter()
            .take(replication_factor as usize)
            .cloned()
            .collect();

        // Keep a local copy when we are among the closest or nobody else is known
        let local_distance = target.distance(&self.local.node_id);
        let store_locally = replicas.len() < replication_factor as usize
            || replicas
                .last()
                .map(|farthest| local_distance < target.distance(&farthest.node_id))
                .unwrap_or(true);

        let results = futures::future::join_all(replicas.iter().map(|peer| {
            let request = DhtStore {
                sender: self.local.clone(),
                key: key.to_string(),
                value: value.clone(),
                ttl_secs,
                replication_factor,
            };
            with_timeout(self.config.query_timeout, self.transport.store(peer, request))
        }))
        .await;

        let mut acknowledged_by = Vec::new();
        let mut expiration_time = 0u64;
        for (peer, result) in replicas.iter().zip(results) {
            match result {
                Ok(response) if response.success => {
                    acknowledged_by.push(peer.node_id);
                    expiration_time = expiration_time.max(response.expiration_time.unwrap_or(0));
                }
                Ok(response) => {
                    debug!(
                        "Node {} refused store of {}: {:?}",
                        peer.node_id, key, response.error_message
                    );
                }
                Err(e) => {
                    debug!("Store of {} at {} failed: {}", key, peer.node_id, e);
                    self.routing_table.write().await.record_failure(&peer.node_id);
                }
            }
        }

        let mut stored_locally = false;
        if store_locally {
            let record = DhtRecord::new(key, value, ttl_secs, replication_factor, self.local.node_id);
            match self.storage.write().await.store(record) {
                Ok(expires_at) => {
                    stored_locally = true;
                    expiration_time = expiration_time.max(expires_at);
                }
                Err(e) => warn!("Local store of {} failed: {}", key, e),
            }
        }

        let replication_count = acknowledged_by.len() as u32 + u32::from(stored_locally);
        if replication_count == 0 {
            return Err(DhtError::StoreFailed {
                attempted: replicas.len(),
            });
        }

        info!(
            "Stored {} on {} node(s) (requested {})",
            key, replication_count, replication_factor
        );
        Ok(StoreReport {
            replication_count,
            expiration_time,
            stored_locally,
            acknowledged_by,
        })
    }

    /// Join the network through known seed peers
    ///
    /// Pings every seed, then looks up our own id to populate nearby buckets.
    /// Returns the routing table size afterwards.
    pub async fn bootstrap(&self, seeds: &[PeerInfo]) -> Result<usize> {
        let pings = futures::future::join_all(seeds.iter().map(|seed| self.ping(seed))).await;
        let reachable = pings.iter().filter(|result| result.is_ok()).count();
        info!("Bootstrap: {}/{} seeds reachable", reachable, seeds.len());

        if reachable == 0 {
            return Err(DhtError::NoKnownNodes);
        }

        self.iterative_find_node(self.local.node_id).await?;
        Ok(self.routing_table.read().await.node_count())
    }

    /// Look up a random id in every bucket idle for longer than `max_age_secs`
    pub async fn refresh_stale_buckets(&self, max_age_secs: u64) -> usize {
        let targets: Vec<NodeId> = {
            let rt = self.routing_table.read().await;
            rt.get_stale_buckets(max_age_secs)
                .into_iter()
                .map(|index| rt.random_id_in_bucket(index))
                .collect()
        };

        for target in &targets {
            if let Err(e) = self.iterative_find_node(*target).await {
                debug!("Bucket refresh lookup for {} failed: {}", target, e);
            }
        }
        targets.len()
    }

    /// Drop expired records and probe nodes silent for `max_node_age_secs`
    ///
    /// Silent nodes are only evicted after failing the probe repeatedly.
    /// Returns the number of expired records and evicted nodes.
    pub async fn run_maintenance(&self, max_node_age_secs: u64) -> (usize, usize) {
        let expired = self.storage.write().await.cleanup_expired();
        let silent = self.routing_table.read().await.silent_nodes(max_node_age_secs);
        let outcomes =
            futures::future::join_all(silent.into_iter().map(|node| self.prober.probe_once(node)))
                .await;
        let evicted = outcomes
            .into_iter()
            .filter(|outcome| *outcome == Some(false))
            .count();
        if expired > 0 || evicted > 0 {
            info!(
                "DHT maintenance: {} expired records, {} unresponsive nodes evicted",
                expired, evicted
            );
        }
        (expired, evicted)
    }

    /// Get reference to routing table
    pub fn routing_table(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.routing_table
    }

    /// Get reference to storage
    pub fn storage(&self) -> &Arc<RwLock<DhtStorage>> {
        &self.storage
    }
}
