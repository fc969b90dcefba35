//! PocketSizedUniverse relay network
//!
//! This crate provides:
//! - Relay membership (join, heartbeats, eviction) on both sides
//! - Out-of-band health checks and relay selection
//! - NAT probe and punch coordination on the relay
//! - The peer-side hole punch state machine

pub mod error;
pub mod health;
pub mod hole_punch;
pub mod membership;
pub mod nat;
pub mod registry;
pub mod service;

pub use error::{RelayError, Result};
pub use health::{rank_relays, select_best_relay, status_for_load, HealthReport, HealthSnapshot};
pub use hole_punch::{HolePuncher, PunchAttempt, PunchConfig, PunchOutcome, PunchState, PunchTransport};
pub use membership::{MembershipState, RelayChannel, RelayClient, RelayMembership};
pub use nat::{NatConfig, NatCoordinator, Observation, PunchPlan};
pub use registry::{RegistryConfig, RelayEntry, RelayRegistry};
pub use service::{RelayReply, RelayService, RelayServiceConfig};

/// Interval members heartbeat at
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Heartbeats a member may miss before it is evicted
pub const DEFAULT_MISSED_HEARTBEAT_THRESHOLD: u32 = 3;

/// Maximum members tracked by a relay
pub const DEFAULT_MAX_RELAYS: usize = 512;

/// Load at which a relay reports `Warning`
pub const WARNING_LOAD_THRESHOLD: f32 = 0.75;

/// Load at which a relay reports `Error`
pub const ERROR_LOAD_THRESHOLD: f32 = 0.95;

/// Delay between coordination and the start of a punch
pub const DEFAULT_PUNCH_LEAD_MILLIS: u64 = 500;

/// Length of the punch window
pub const DEFAULT_PUNCH_WINDOW_MILLIS: u64 = 5_000;
