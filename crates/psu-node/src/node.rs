//! A running node
//!
//! [`Node::start`] binds the listener, wires the DHT, relay, hole punch and
//! transfer components to the connection layer, and spawns the accept loop
//! and the periodic maintenance tasks.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{NodeError, Result};
use crate::network::Network;
use crate::rpc::NetworkTransport;
use psu_crypto::NodeIdentity;
use psu_dht::{DhtService, FindValueResult, StoreReport};
use psu_protocol::payload::{NatProbe, NatPunchRequest, Ping};
use psu_protocol::{Message, NodeId, Payload, PeerInfo, PendingRequests};
use psu_relay::{
    HolePuncher, PunchOutcome, RelayClient, RelayError, RelayMembership, RelayService,
};
use psu_transfer::{TransferEvent, TransferManager};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upper bound on how long the retransmission loop sleeps
const RETRANSMIT_POLL: Duration = Duration::from_millis(250);

/// Service advertised when this node relays for others
pub const RELAY_SERVICE: &str = "relay";

pub struct Node {
    config: Config,
    local: PeerInfo,
    pending: PendingRequests,
    network: Arc<Network>,
    dht: Arc<DhtService>,
    relay: Option<Arc<RelayService>>,
    puncher: Arc<HolePuncher>,
    transfers: Arc<TransferManager>,
    relay_client: RwLock<Option<Arc<RelayClient>>>,
    events: Mutex<mpsc::UnboundedReceiver<TransferEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the configured address and start serving
    pub async fn start(config: Config, identity: NodeIdentity) -> Result<Arc<Self>> {
        config.validate()?;
        let listener = TcpListener::bind(config.node.listen_address).await?;
        let bound = listener.local_addr()?;
        let advertised = config.node.advertise_address.unwrap_or(bound);
        if advertised.ip().is_unspecified() {
            warn!(
                "Advertising unspecified address {}; set node.advertise_address",
                advertised
            );
        }

        let identity = Arc::new(identity);
        let mut local = PeerInfo::from_identity(&identity, advertised);
        local.services = config.node.services.clone();
        if config.relay.enabled {
            local.services.insert(RELAY_SERVICE.to_string());
        }

        let pending = PendingRequests::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let network = Arc::new(Network::new(
            identity.clone(),
            config.node.protocol_version,
            pending.clone(),
            config.request_timeout(),
            Some(events_tx),
        ));
        let transport = Arc::new(NetworkTransport::new(&network));

        let dht = Arc::new(DhtService::with_components(
            local.clone(),
            config.dht_config(),
            Arc::new(RwLock::new(psu_dht::RoutingTable::new(local.node_id))),
            Arc::new(RwLock::new(config.dht_storage())),
            transport.clone(),
        ));
        let relay = config
            .relay
            .enabled
            .then(|| Arc::new(RelayService::new(local.clone(), config.relay_config())));
        let puncher = Arc::new(HolePuncher::new(
            local.node_id,
            transport,
            config.punch_config(),
        ));
        let transfers = Arc::new(TransferManager::new(config.transfer_config()));

        network.attach(Arc::new(Dispatcher::new(
            config.node.protocol_version,
            config.message_ttl(),
            pending.clone(),
            dht.clone(),
            relay.clone(),
            puncher.clone(),
            transfers.clone(),
        )));

        info!(
            "Node {} listening on {} (advertising {})",
            local.node_id, bound, advertised
        );

        let node = Arc::new(Self {
            config,
            local,
            pending,
            network,
            dht,
            relay,
            puncher,
            transfers,
            relay_client: RwLock::new(None),
            events: Mutex::new(events_rx),
            tasks: Mutex::new(Vec::new()),
        });
        node.spawn_tasks(listener).await;
        Ok(node)
    }

    async fn spawn_tasks(self: &Arc<Self>, listener: TcpListener) {
        let mut tasks = self.tasks.lock().await;

        let network = self.network.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = network.serve(listener).await {
                warn!("Accept loop stopped: {}", e);
            }
        }));

        let node = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.dht.maintenance_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else { break };
                node.run_maintenance().await;
            }
        }));

        let node = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            loop {
                let wake = {
                    let Some(node) = node.upgrade() else { break };
                    let cap = Instant::now() + RETRANSMIT_POLL;
                    match node.transfers.next_deadline().await {
                        Some(deadline) => Instant::from_std(deadline).min(cap),
                        None => cap,
                    }
                };
                tokio::time::sleep_until(wake).await;
                let Some(node) = node.upgrade() else { break };
                node.flush_retransmissions().await;
            }
        }));
    }

    pub fn node_id(&self) -> &NodeId {
        &self.local.node_id
    }

    /// How other peers reach this node
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn dht(&self) -> &Arc<DhtService> {
        &self.dht
    }

    pub fn relay_service(&self) -> Option<&Arc<RelayService>> {
        self.relay.as_ref()
    }

    pub fn hole_puncher(&self) -> &Arc<HolePuncher> {
        &self.puncher
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    /// Next finished transfer
    pub async fn next_event(&self) -> Option<TransferEvent> {
        self.events.lock().await.recv().await
    }

    /// Join the DHT through the configured bootstrap peers
    ///
    /// Returns the routing table size afterwards.
    pub async fn bootstrap(&self) -> Result<usize> {
        let seeds = self.config.bootstrap_peers()?;
        self.bootstrap_with(&seeds).await
    }

    pub async fn bootstrap_with(&self, seeds: &[PeerInfo]) -> Result<usize> {
        Ok(self.dht.bootstrap(seeds).await?)
    }

    /// Round trip of a `Ping` to `peer`
    pub async fn ping(&self, peer: &PeerInfo) -> Result<Duration> {
        let started = Instant::now();
        match self.network.call(peer, Payload::Ping(Ping)).await? {
            Payload::Pong(_) => Ok(started.elapsed()),
            other => Err(NodeError::UnexpectedResponse(other.message_type())),
        }
    }

    pub async fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u32,
        replication_factor: u32,
    ) -> Result<StoreReport> {
        Ok(self
            .dht
            .store(key, value, ttl_secs, replication_factor)
            .await?)
    }

    pub async fn find_value(&self, key: &str) -> Result<FindValueResult> {
        Ok(self.dht.find_value(key).await?)
    }

    pub async fn find_node(&self, target: NodeId) -> Result<Vec<PeerInfo>> {
        Ok(self.dht.iterative_find_node(target).await?)
    }

    /// Offer `content` to peers; returns its hash
    pub async fn share_file(&self, content: Vec<u8>, metadata: BTreeMap<String, String>) -> String {
        self.transfers.share_file(content, metadata).await
    }

    /// Ask `peer` for the file with `file_hash`
    ///
    /// Completion is reported through [`Node::next_event`].
    pub async fn request_file(&self, peer: &PeerInfo, file_hash: &str) -> Result<()> {
        let request = self.transfers.request_file(peer.node_id, file_hash).await?;
        let link = self.network.link_for(peer).await?;
        self.network
            .send_on(&link, Message::new(Payload::FileRequest(request)))
            .await
    }

    /// Cancel a transfer with `peer` and tell it so
    pub async fn cancel_transfer(
        &self,
        peer: &NodeId,
        file_hash: &str,
        reason: Option<String>,
    ) -> Result<()> {
        let cancel = self.transfers.cancel(*peer, file_hash, reason).await?;
        self.network
            .send_to(peer, Message::new(Payload::FileCancel(cancel)))
            .await
    }

    /// Our public address as seen by `relay`
    pub async fn probe_nat(&self, relay: &PeerInfo) -> Result<SocketAddr> {
        let probe = NatProbe {
            local_address: self.local.address,
        };
        match self.network.call(relay, Payload::NatProbe(probe)).await? {
            Payload::NatProbeResponse(response) => {
                if response.observed_address != self.local.address {
                    info!(
                        "Relay {} sees us at {} (local {})",
                        relay.node_id, response.observed_address, self.local.address
                    );
                }
                Ok(response.observed_address)
            }
            other => Err(NodeError::UnexpectedResponse(other.message_type())),
        }
    }

    /// Ask `relay` to coordinate a punch to `target` and run our side of it
    pub async fn punch_via_relay(&self, relay: &PeerInfo, target: NodeId) -> Result<PunchOutcome> {
        let request = NatPunchRequest { target };
        match self
            .network
            .call(relay, Payload::NatPunchRequest(request))
            .await?
        {
            Payload::NatPunchCoordinate(coordinate) => Ok(self.puncher.punch(coordinate).await),
            other => Err(NodeError::UnexpectedResponse(other.message_type())),
        }
    }

    /// Join `relay` and keep the membership alive with heartbeats
    ///
    /// Returns the relays the relay told us about. After an eviction the
    /// heartbeat task joins again.
    pub async fn join_relay(self: &Arc<Self>, relay: PeerInfo) -> Result<Vec<PeerInfo>> {
        let membership = RelayMembership::with_threshold(
            self.local.clone(),
            relay,
            self.config.relay.missed_heartbeat_threshold,
        );
        let client = Arc::new(RelayClient::new(
            membership,
            Arc::new(NetworkTransport::new(&self.network)),
            self.config.request_timeout(),
        ));
        let known = client.join().await?;

        if let Some(previous) = self.relay_client.write().await.replace(client.clone()) {
            debug!("Replacing relay membership with {:?}", previous.state().await);
        }
        let node = Arc::downgrade(self);
        let fallback = Duration::from_secs(self.config.relay.heartbeat_interval_secs);
        self.tasks.lock().await.push(tokio::spawn(async move {
            loop {
                sleep(client.heartbeat_interval().await.unwrap_or(fallback)).await;
                let Some(node) = node.upgrade() else { break };
                let connected = node.network.connection_count().await as u32;
                let load = node.relay.as_ref().map_or(0.0, |relay| relay.load());
                match client.heartbeat(load, connected).await {
                    Ok(()) => {}
                    Err(RelayError::Evicted { .. }) => {
                        warn!("Evicted from relay, joining again");
                        if let Err(e) = client.join().await {
                            warn!("Rejoin failed: {}", e);
                        }
                    }
                    Err(RelayError::InvalidState { .. }) => {
                        if let Err(e) = client.join().await {
                            debug!("Rejoin failed: {}", e);
                        }
                    }
                    Err(e) => debug!("Heartbeat failed: {}", e),
                }
            }
        }));
        Ok(known)
    }

    pub async fn relay_client(&self) -> Option<Arc<RelayClient>> {
        self.relay_client.read().await.clone()
    }

    /// Send due chunk retransmissions and transfer failures
    pub async fn flush_retransmissions(&self) {
        for (peer, payload) in self.transfers.poll_retransmissions().await {
            if let Err(e) = self.network.send_to(&peer, Message::new(payload)).await {
                debug!("Retransmission to {} not sent: {}", peer, e);
            }
        }
    }

    /// One pass of periodic upkeep across all components
    pub async fn run_maintenance(&self) {
        let max_node_age = self.config.dht.max_node_age_secs;
        self.dht.run_maintenance(max_node_age).await;
        let refreshed = self
            .dht
            .refresh_stale_buckets(self.config.dht.maintenance_interval_secs.saturating_mul(10))
            .await;
        if refreshed > 0 {
            debug!("Refreshed {} stale buckets", refreshed);
        }

        if let Some(relay) = &self.relay {
            relay.set_connected_peers(self.network.connection_count().await as u32);
            relay.run_maintenance().await;
        }

        self.flush_retransmissions().await;
        for (peer, file_hash) in self.transfers.sweep_idle().await {
            debug!("Dropped idle transfer of {} with {}", file_hash, peer);
        }
        let expired = self
            .pending
            .expire_older_than(self.config.request_timeout() * 2)
            .await;
        if expired > 0 {
            debug!("Expired {} abandoned requests", expired);
        }
    }

    /// Stop the accept loop and background tasks
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Node {} stopped", self.local.node_id);
    }
}
