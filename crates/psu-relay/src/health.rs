//! Relay health reporting and selection
//!
//! Health checks are answered out of band from membership. Status is derived
//! from load, and clients rank relays by status, then response time, then
//! load.

use crate::{ERROR_LOAD_THRESHOLD, WARNING_LOAD_THRESHOLD};
use psu_protocol::payload::{HealthStatus, RelayHealthCheck, RelayHealthResponse};
use psu_protocol::NodeId;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

/// Map load onto a coarse health status
pub fn status_for_load(load: f32) -> HealthStatus {
    if load >= ERROR_LOAD_THRESHOLD {
        HealthStatus::Error
    } else if load >= WARNING_LOAD_THRESHOLD {
        HealthStatus::Warning
    } else {
        HealthStatus::Ok
    }
}

/// Snapshot of the local relay used to answer health checks
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub relay_node_id: NodeId,
    pub load: f32,
    pub connected_peers: u32,
    pub members: usize,
    pub uptime_secs: u64,
}

/// Build the response to a health check
///
/// `started` is when handling of the check began; the elapsed time is
/// reported as `response_time_ms`.
pub fn health_response(
    check: &RelayHealthCheck,
    snapshot: &HealthSnapshot,
    started: Instant,
) -> RelayHealthResponse {
    let load = snapshot.load.clamp(0.0, 1.0);
    let mut metrics = BTreeMap::new();
    metrics.insert("members".to_string(), snapshot.members.to_string());
    metrics.insert("uptime_secs".to_string(), snapshot.uptime_secs.to_string());
    metrics.insert("load".to_string(), format!("{:.3}", load));

    RelayHealthResponse {
        relay_node_id: snapshot.relay_node_id,
        status: status_for_load(load),
        sent_at_millis: check.sent_at_millis,
        response_time_ms: started.elapsed().as_millis().min(u32::MAX as u128) as u32,
        load,
        connected_peers: snapshot.connected_peers,
        metrics,
    }
}

/// A health response as seen by the client that asked
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub response: RelayHealthResponse,

    /// Client-measured round trip
    pub round_trip_ms: u64,
}

impl HealthReport {
    pub fn new(response: RelayHealthResponse, round_trip_ms: u64) -> Self {
        Self {
            response,
            round_trip_ms,
        }
    }

    pub fn relay_node_id(&self) -> &NodeId {
        &self.response.relay_node_id
    }

    fn rank(&self, other: &Self) -> Ordering {
        self.response
            .status
            .cmp(&other.response.status)
            .then(self.round_trip_ms.cmp(&other.round_trip_ms))
            .then(self.response.load.total_cmp(&other.response.load))
    }
}

/// Order reports best first
pub fn rank_relays(reports: &mut [HealthReport]) {
    reports.sort_by(|a, b| a.rank(b));
}

/// The best relay among `reports`, skipping relays in `Error`
pub fn select_best_relay(reports: &[HealthReport]) -> Option<&HealthReport> {
    reports
        .iter()
        .filter(|report| report.response.status != HealthStatus::Error)
        .min_by(|a, b| a.rank(b))
}
