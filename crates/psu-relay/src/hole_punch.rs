//! Peer side of NAT hole punching
//!
//! A punch is an explicit two-phase state machine. Phase one is receiving
//! the relay's coordinate; phase two is dialing the peer's observed address
//! inside the agreed window:
//!
//! `CoordinateReceived -> PunchAttempted -> Connected | TimedOut | Failed`
//!
//! Both sides dial each other at the same time. Each side accepts the
//! other's `ConnectionRequest` only for a session it holds a coordinate for.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use psu_protocol::payload::{ConnectionRequest, ConnectionResponse, NatPunchCoordinate};
use psu_protocol::{now_millis, NodeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Hole punch tunables
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Maximum connection requests per punch
    pub max_attempts: u32,

    /// Wait for a single connection response
    pub attempt_timeout: Duration,

    /// Delay between attempts
    pub retry_interval: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(200),
        }
    }
}

/// Where a punch currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PunchState {
    CoordinateReceived,
    PunchAttempted { attempts: u32 },
    Connected(SocketAddr),
    TimedOut,
    Failed(String),
}

/// How a punch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PunchOutcome {
    /// Direct path established to this address
    Connected(SocketAddr),
    /// The peer answered and refused
    Rejected(String),
    /// No acceptable answer inside the window
    TimedOut,
}

/// State of one punch attempt
#[derive(Debug, Clone)]
pub struct PunchAttempt {
    coordinate: NatPunchCoordinate,
    state: PunchState,
    start_at: Instant,
    deadline: Instant,
}

impl PunchAttempt {
    /// Enter `CoordinateReceived`, mapping the wall-clock window onto
    /// monotonic time
    pub fn new(coordinate: NatPunchCoordinate) -> Self {
        let delay_ms = (coordinate.attempt_at_millis - now_millis()).max(0) as u64;
        let start_at = Instant::now() + Duration::from_millis(delay_ms);
        let deadline = start_at + Duration::from_millis(coordinate.window_millis as u64);
        Self {
            coordinate,
            state: PunchState::CoordinateReceived,
            start_at,
            deadline,
        }
    }

    pub fn session_id(&self) -> &[u8; 16] {
        &self.coordinate.session_id
    }

    pub fn peer(&self) -> &NodeId {
        &self.coordinate.peer
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.coordinate.peer_address
    }

    pub fn state(&self) -> &PunchState {
        &self.state
    }

    pub fn start_at(&self) -> Instant {
        self.start_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn attempts(&self) -> u32 {
        match self.state {
            PunchState::PunchAttempted { attempts } => attempts,
            _ => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            PunchState::Connected(_) | PunchState::TimedOut | PunchState::Failed(_)
        )
    }

    /// Count a connection request sent to the peer
    pub fn record_attempt(&mut self) -> Result<u32> {
        let attempts = match self.state {
            PunchState::CoordinateReceived => 1,
            PunchState::PunchAttempted { attempts } => attempts + 1,
            _ => {
                return Err(RelayError::InvalidState {
                    state: "finished punch",
                    event: "punch attempt",
                })
            }
        };
        self.state = PunchState::PunchAttempted { attempts };
        Ok(attempts)
    }

    /// Apply the peer's answer; `None` if it belongs to another session
    pub fn on_response(&mut self, response: &ConnectionResponse) -> Option<PunchOutcome> {
        if response.session_id != self.coordinate.session_id
            || !matches!(self.state, PunchState::PunchAttempted { .. })
        {
            return None;
        }

        if response.accepted {
            self.state = PunchState::Connected(self.coordinate.peer_address);
            Some(PunchOutcome::Connected(self.coordinate.peer_address))
        } else {
            let reason = response
                .reason
                .clone()
                .unwrap_or_else(|| "rejected".to_string());
            self.state = PunchState::Failed(reason.clone());
            Some(PunchOutcome::Rejected(reason))
        }
    }

    /// The window closed without an answer
    pub fn on_timeout(&mut self) -> PunchOutcome {
        if !self.is_terminal() {
            self.state = PunchState::TimedOut;
        }
        PunchOutcome::TimedOut
    }
}

/// Direct connection attempts to a peer's observed address
#[async_trait]
pub trait PunchTransport: Send + Sync {
    async fn connect(
        &self,
        address: SocketAddr,
        request: ConnectionRequest,
    ) -> Result<ConnectionResponse>;
}

/// A coordinate we accept the peer's connection requests for
#[derive(Debug, Clone, Copy)]
struct PunchSession {
    peer: NodeId,
    /// End of the punch window
    expires_at: Instant,
}

/// Runs punches for the local node and answers the peer side of them
///
/// A session stays open until its window closes, so the peer's own dial can
/// still be accepted after ours connected.
pub struct HolePuncher {
    local_id: NodeId,
    transport: Arc<dyn PunchTransport>,
    config: PunchConfig,
    /// Sessions we hold a coordinate for, by session id
    sessions: Mutex<HashMap<[u8; 16], PunchSession>>,
}

fn drop_closed(sessions: &mut HashMap<[u8; 16], PunchSession>, now: Instant) {
    sessions.retain(|_, session| session.expires_at > now);
}

impl HolePuncher {
    pub fn new(local_id: NodeId, transport: Arc<dyn PunchTransport>, config: PunchConfig) -> Self {
        Self {
            local_id,
            transport,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Execute the coordinate: wait for the window, then dial with retries
    pub async fn punch(&self, coordinate: NatPunchCoordinate) -> PunchOutcome {
        let mut attempt = PunchAttempt::new(coordinate);
        let session_id = *attempt.session_id();
        {
            let mut sessions = self.sessions.lock().await;
            drop_closed(&mut sessions, Instant::now());
            sessions.insert(
                session_id,
                PunchSession {
                    peer: *attempt.peer(),
                    expires_at: attempt.deadline(),
                },
            );
        }

        debug!(
            "Punch to {} at {} starts in {:?}",
            attempt.peer(),
            attempt.peer_address(),
            attempt.start_at().saturating_duration_since(Instant::now())
        );
        sleep_until(attempt.start_at()).await;

        let request = ConnectionRequest {
            session_id,
            from: self.local_id,
        };

        loop {
            let now = Instant::now();
            if now >= attempt.deadline() || attempt.attempts() >= self.config.max_attempts {
                break;
            }
            if let Err(e) = attempt.record_attempt() {
                warn!("Punch state error: {}", e);
                break;
            }

            let remaining = attempt.deadline() - now;
            let wait = remaining.min(self.config.attempt_timeout);
            match timeout(
                wait,
                self.transport.connect(attempt.peer_address(), request.clone()),
            )
            .await
            {
                Ok(Ok(response)) => {
                    if let Some(outcome) = attempt.on_response(&response) {
                        if !matches!(outcome, PunchOutcome::Connected(_)) {
                            self.forget(&session_id).await;
                        }
                        info!("Punch to {} finished: {:?}", attempt.peer(), outcome);
                        return outcome;
                    }
                }
                Ok(Err(e)) => debug!("Punch attempt {} failed: {}", attempt.attempts(), e),
                Err(_) => debug!("Punch attempt {} timed out", attempt.attempts()),
            }

            let left = attempt.deadline().saturating_duration_since(Instant::now());
            sleep(self.config.retry_interval.min(left)).await;
        }

        self.forget(&session_id).await;
        info!("Punch to {} timed out", attempt.peer());
        attempt.on_timeout()
    }

    /// Answer a peer's connection request
    pub async fn handle_connection_request(&self, request: &ConnectionRequest) -> ConnectionResponse {
        let mut sessions = self.sessions.lock().await;
        drop_closed(&mut sessions, Instant::now());
        let (accepted, reason) = match sessions.get(&request.session_id) {
            Some(session) if session.peer == request.from => (true, None),
            Some(_) => (false, Some("unexpected peer for session".to_string())),
            None => (false, Some("unknown punch session".to_string())),
        };
        if !accepted {
            debug!("Refusing connection request from {}: {:?}", request.from, reason);
        }
        ConnectionResponse {
            session_id: request.session_id,
            accepted,
            reason,
        }
    }

    /// Stop accepting connection requests for a session
    pub async fn forget(&self, session_id: &[u8; 16]) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }

    /// Sessions whose window is still open
    pub async fn active_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        drop_closed(&mut sessions, Instant::now());
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psu_crypto::NODE_ID_SIZE;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_SIZE])
    }

    fn coordinate(lead_ms: i64, window_millis: u32) -> NatPunchCoordinate {
        NatPunchCoordinate {
            session_id: [7; 16],
            peer: id(2),
            peer_address: "198.51.100.7:41000".parse().unwrap(),
            attempt_at_millis: now_millis() + lead_ms,
            window_millis,
        }
    }

    struct ScriptedTransport {
        accept_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PunchTransport for ScriptedTransport {
        async fn connect(
            &self,
            _address: SocketAddr,
            request: ConnectionRequest,
        ) -> Result<ConnectionResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.accept_after {
                return Err(RelayError::Transport("no route".to_string()));
            }
            Ok(ConnectionResponse {
                session_id: request.session_id,
                accepted: true,
                reason: None,
            })
        }
    }

    #[test]
    fn test_state_machine_connected() {
        let mut attempt = PunchAttempt::new(coordinate(0, 1_000));
        assert_eq!(attempt.state(), &PunchState::CoordinateReceived);

        // Responses before any attempt are ignored
        let accept = ConnectionResponse {
            session_id: [7; 16],
            accepted: true,
            reason: None,
        };
        assert!(attempt.on_response(&accept).is_none());

        assert_eq!(attempt.record_attempt().unwrap(), 1);
        assert_eq!(attempt.record_attempt().unwrap(), 2);
        assert_eq!(
            attempt.on_response(&accept),
            Some(PunchOutcome::Connected(attempt.peer_address()))
        );
        assert!(attempt.is_terminal());
        assert!(attempt.record_attempt().is_err());
    }

    #[test]
    fn test_state_machine_rejected_is_distinct() {
        let mut attempt = PunchAttempt::new(coordinate(0, 1_000));
        attempt.record_attempt().unwrap();

        let other_session = ConnectionResponse {
            session_id: [8; 16],
            accepted: true,
            reason: None,
        };
        assert!(attempt.on_response(&other_session).is_none());

        let reject = ConnectionResponse {
            session_id: [7; 16],
            accepted: false,
            reason: Some("busy".to_string()),
        };
        assert_eq!(
            attempt.on_response(&reject),
            Some(PunchOutcome::Rejected("busy".to_string()))
        );
        assert_eq!(attempt.state(), &PunchState::Failed("busy".to_string()));
    }

    #[test]
    fn test_window_mapped_onto_instants() {
        let attempt = PunchAttempt::new(coordinate(-5_000, 2_000));
        // A window in the past starts immediately
        assert!(attempt.start_at() <= Instant::now());
        assert_eq!(attempt.deadline() - attempt.start_at(), Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_punch_retries_until_accepted() {
        let transport = Arc::new(ScriptedTransport {
            accept_after: 3,
            calls: AtomicU32::new(0),
        });
        let puncher = HolePuncher::new(id(1), transport.clone(), PunchConfig::default());

        let outcome = puncher.punch(coordinate(100, 5_000)).await;
        assert_eq!(
            outcome,
            PunchOutcome::Connected("198.51.100.7:41000".parse().unwrap())
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_punch_times_out() {
        let transport = Arc::new(ScriptedTransport {
            accept_after: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let config = PunchConfig {
            max_attempts: 3,
            ..PunchConfig::default()
        };
        let puncher = HolePuncher::new(id(1), transport.clone(), config);

        assert_eq!(puncher.punch(coordinate(0, 5_000)).await, PunchOutcome::TimedOut);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(puncher.active_sessions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_session_closes_with_window() {
        let transport = Arc::new(ScriptedTransport {
            accept_after: 1,
            calls: AtomicU32::new(0),
        });
        let puncher = HolePuncher::new(id(1), transport, PunchConfig::default());

        let outcome = puncher.punch(coordinate(100, 5_000)).await;
        assert!(matches!(outcome, PunchOutcome::Connected(_)));

        // The peer may still dial in while the window is open
        assert_eq!(puncher.active_sessions().await, 1);
        let late = ConnectionRequest {
            session_id: [7; 16],
            from: id(2),
        };
        assert!(puncher.handle_connection_request(&late).await.accepted);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(puncher.active_sessions().await, 0);
        assert!(!puncher.handle_connection_request(&late).await.accepted);
    }

    #[tokio::test]
    async fn test_connection_request_needs_known_session() {
        let transport = Arc::new(ScriptedTransport {
            accept_after: 1,
            calls: AtomicU32::new(0),
        });
        let puncher = HolePuncher::new(id(1), transport, PunchConfig::default());
        puncher.sessions.lock().await.insert(
            [7; 16],
            PunchSession {
                peer: id(2),
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );

        let ok = puncher
            .handle_connection_request(&ConnectionRequest {
                session_id: [7; 16],
                from: id(2),
            })
            .await;
        assert!(ok.accepted);

        let wrong_peer = puncher
            .handle_connection_request(&ConnectionRequest {
                session_id: [7; 16],
                from: id(3),
            })
            .await;
        assert!(!wrong_peer.accepted);

        let unknown = puncher
            .handle_connection_request(&ConnectionRequest {
                session_id: [9; 16],
                from: id(2),
            })
            .await;
        assert!(!unknown.accepted);
    }
}
