//! PocketSizedUniverse DHT (Distributed Hash Table)
//!
//! This module implements a Kademlia-based DHT for:
//! - Peer discovery and routing
//! - Decentralized key-value storage with expiring records
//! - Liveness probing of full buckets before eviction

pub mod dht;
pub mod error;
pub mod iterative_lookup;
pub mod kbucket;
pub mod node_info;
pub mod operations;
pub mod request_handler;
pub mod routing_table;
pub mod storage;

pub use dht::{DhtConfig, DhtService, DhtTransport};
pub use error::{DhtError, Result};
pub use iterative_lookup::{IterativeLookup, LookupStats};
pub use kbucket::{FailureOutcome, InsertOutcome, KBucket};
pub use node_info::NodeInfo;
pub use operations::{FindValueResult, StoreReport};
pub use request_handler::DhtRequestHandler;
pub use routing_table::RoutingTable;
pub use storage::{clamp_ttl, DhtRecord, DhtStorage};

/// Kademlia k parameter (nodes per k-bucket)
pub const K: usize = 20;

/// Alpha parameter (parallel queries)
pub const ALPHA: usize = 3;

/// Number of k-buckets, one per bit of a 160-bit node id
pub const NUM_BUCKETS: usize = psu_crypto::NODE_ID_SIZE * 8;

/// Consecutive failed probes before a node is evicted
pub const MAX_PROBE_FAILURES: u32 = 3;

/// Upper bound on record lifetime (24 hours)
pub const MAX_TTL_SECS: u64 = 24 * 60 * 60;

/// Maximum DHT storage per node (bytes)
pub const MAX_DHT_STORAGE_BYTES: usize = 100 * 1024 * 1024; // 100MB

/// Maximum number of DHT keys
pub const MAX_DHT_KEYS: usize = 10_000;

/// Maximum value size (bytes)
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1MB
