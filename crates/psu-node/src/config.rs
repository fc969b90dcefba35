//! Node configuration
//!
//! Loaded from a TOML file with `[node]`, `[dht]`, `[relay]`, `[transfer]`
//! and `[logging]` sections. Every field has a default, so a partial file
//! (or no file at all) yields a working configuration.

use crate::error::{NodeError, Result};
use psu_dht::{DhtConfig, DhtStorage, MAX_DHT_KEYS, MAX_DHT_STORAGE_BYTES};
use psu_protocol::{now_secs, NodeId, PeerInfo, PROTOCOL_VERSION};
use psu_relay::{NatConfig, PunchConfig, RegistryConfig, RelayServiceConfig};
use psu_transfer::{RetryPolicy, TransferConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeSection,
    pub dht: DhtSection,
    pub relay: RelaySection,
    pub transfer: TransferSection,
    pub logging: LoggingSection,
}

/// `[node]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Address to accept connections on
    pub listen_address: SocketAddr,

    /// Address advertised to peers, when different from the listen address
    pub advertise_address: Option<SocketAddr>,

    /// Hex-encoded identity seed; generated on first start when missing
    pub key_file: Option<PathBuf>,

    /// Envelope version sent and accepted
    pub protocol_version: u8,

    /// Messages older than this are dropped
    pub message_ttl_secs: u64,

    /// Wait for a correlated response
    pub request_timeout_secs: u64,

    /// Services advertised in our peer info
    pub services: BTreeSet<String>,

    /// Seed peers as `<node-id-hex>@<address>`
    pub bootstrap: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 7420)),
            advertise_address: None,
            key_file: None,
            protocol_version: PROTOCOL_VERSION,
            message_ttl_secs: 300,
            request_timeout_secs: 10,
            services: ["dht".to_string(), "files".to_string()].into_iter().collect(),
            bootstrap: Vec::new(),
        }
    }
}

/// `[dht]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSection {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout_secs: u64,
    pub max_lookup_rounds: usize,
    pub max_stored_keys: usize,
    pub max_storage_bytes: usize,
    /// Period of record expiry, node pruning and bucket refresh
    pub maintenance_interval_secs: u64,
    /// Nodes silent for longer are probed for liveness
    pub max_node_age_secs: u64,
}

impl Default for DhtSection {
    fn default() -> Self {
        let defaults = DhtConfig::default();
        Self {
            k: defaults.k,
            alpha: defaults.alpha,
            query_timeout_secs: defaults.query_timeout.as_secs(),
            max_lookup_rounds: defaults.max_lookup_rounds,
            max_stored_keys: MAX_DHT_KEYS,
            max_storage_bytes: MAX_DHT_STORAGE_BYTES,
            maintenance_interval_secs: 60,
            max_node_age_secs: 3_600,
        }
    }
}

/// `[relay]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Offer relay and NAT coordination to other peers
    pub enabled: bool,
    /// Relay to join as a member, as `<node-id-hex>@<address>`
    pub join: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeat_threshold: u32,
    pub max_relays: usize,
    pub max_connections: u32,
    pub punch_lead_millis: u64,
    pub punch_window_millis: u64,
    pub punch_max_attempts: u32,
    pub punch_attempt_timeout_millis: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            join: None,
            heartbeat_interval_secs: psu_relay::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            missed_heartbeat_threshold: psu_relay::DEFAULT_MISSED_HEARTBEAT_THRESHOLD,
            max_relays: psu_relay::DEFAULT_MAX_RELAYS,
            max_connections: 256,
            punch_lead_millis: psu_relay::DEFAULT_PUNCH_LEAD_MILLIS,
            punch_window_millis: psu_relay::DEFAULT_PUNCH_WINDOW_MILLIS,
            punch_max_attempts: 5,
            punch_attempt_timeout_millis: 1_000,
        }
    }
}

/// `[transfer]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub chunk_size: u32,
    pub ack_timeout_millis: u64,
    pub max_backoff_millis: u64,
    pub max_retries: u32,
    pub max_in_flight: usize,
    pub idle_timeout_secs: u64,
    pub max_sessions: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let defaults = TransferConfig::default();
        Self {
            chunk_size: defaults.chunk_size,
            ack_timeout_millis: retry.ack_timeout.as_millis() as u64,
            max_backoff_millis: retry.max_backoff.as_millis() as u64,
            max_retries: retry.max_retries,
            max_in_flight: retry.max_in_flight,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            max_sessions: defaults.max_sessions,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level for this node's targets; `RUST_LOG` takes precedence
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from `path`, or use defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("Config file {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dht.k == 0 || self.dht.alpha == 0 {
            return Err(NodeError::Config("dht.k and dht.alpha must be at least 1".into()));
        }
        if self.dht.maintenance_interval_secs == 0 || self.node.request_timeout_secs == 0 {
            return Err(NodeError::Config(
                "dht.maintenance_interval_secs and node.request_timeout_secs must be at least 1"
                    .into(),
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(NodeError::Config("transfer.chunk_size must be at least 1".into()));
        }
        if self.transfer.max_in_flight == 0 {
            return Err(NodeError::Config("transfer.max_in_flight must be at least 1".into()));
        }
        if self.relay.missed_heartbeat_threshold == 0 {
            return Err(NodeError::Config(
                "relay.missed_heartbeat_threshold must be at least 1".into(),
            ));
        }
        for seed in &self.node.bootstrap {
            parse_peer(seed)?;
        }
        if let Some(relay) = &self.relay.join {
            parse_peer(relay)?;
        }
        Ok(())
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.dht.k,
            alpha: self.dht.alpha,
            query_timeout: Duration::from_secs(self.dht.query_timeout_secs),
            max_lookup_rounds: self.dht.max_lookup_rounds,
            max_lookup_queries: self.dht.max_lookup_rounds * self.dht.alpha,
        }
    }

    pub fn dht_storage(&self) -> DhtStorage {
        DhtStorage::with_limits(self.dht.max_storage_bytes, self.dht.max_stored_keys)
    }

    pub fn relay_config(&self) -> RelayServiceConfig {
        RelayServiceConfig {
            registry: RegistryConfig {
                heartbeat_interval: Duration::from_secs(self.relay.heartbeat_interval_secs),
                missed_heartbeat_threshold: self.relay.missed_heartbeat_threshold,
                max_relays: self.relay.max_relays,
            },
            nat: NatConfig {
                punch_lead: Duration::from_millis(self.relay.punch_lead_millis),
                punch_window: Duration::from_millis(self.relay.punch_window_millis),
                ..NatConfig::default()
            },
            max_connections: self.relay.max_connections,
        }
    }

    pub fn punch_config(&self) -> PunchConfig {
        PunchConfig {
            max_attempts: self.relay.punch_max_attempts,
            attempt_timeout: Duration::from_millis(self.relay.punch_attempt_timeout_millis),
            ..PunchConfig::default()
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            retry: RetryPolicy {
                ack_timeout: Duration::from_millis(self.transfer.ack_timeout_millis),
                max_backoff: Duration::from_millis(self.transfer.max_backoff_millis),
                max_retries: self.transfer.max_retries,
                max_in_flight: self.transfer.max_in_flight,
            },
            idle_timeout: Duration::from_secs(self.transfer.idle_timeout_secs),
            max_sessions: self.transfer.max_sessions,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.node.request_timeout_secs)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.node.message_ttl_secs)
    }

    /// Bootstrap seeds as peer infos
    pub fn bootstrap_peers(&self) -> Result<Vec<PeerInfo>> {
        self.node.bootstrap.iter().map(|seed| parse_peer(seed)).collect()
    }
}

/// Parse `<node-id-hex>@<address>` into a peer description
///
/// The public key is learned from the peer's first signed message.
pub fn parse_peer(spec: &str) -> Result<PeerInfo> {
    let (id, address) = spec
        .split_once('@')
        .ok_or_else(|| NodeError::Config(format!("expected <node-id>@<address>, got {}", spec)))?;
    let node_id = NodeId::from_hex(id)
        .map_err(|e| NodeError::Config(format!("bad node id in {}: {}", spec, e)))?;
    let address = address
        .parse()
        .map_err(|e| NodeError::Config(format!("bad address in {}: {}", spec, e)))?;
    Ok(PeerInfo {
        node_id,
        public_key: [0; 32],
        address,
        services: BTreeSet::new(),
        last_seen: now_secs(),
        reputation: 0.5,
    })
}
