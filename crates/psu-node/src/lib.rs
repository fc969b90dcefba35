//! PocketSizedUniverse node
//!
//! Ties the protocol components together into a running peer:
//! - TOML configuration and a persistent identity
//! - TCP connections carrying signed, length-prefixed envelopes
//! - A dispatcher routing inbound messages to the DHT, relay, hole punch
//!   and file transfer components
//! - Periodic maintenance and relay heartbeats

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod logging;
pub mod network;
pub mod node;
pub mod rpc;

pub use config::{parse_peer, Config};
pub use dispatcher::{Dispatch, Dispatcher};
pub use error::{NodeError, Result};
pub use network::{Network, PeerLink};
pub use node::{Node, RELAY_SERVICE};
pub use rpc::NetworkTransport;
