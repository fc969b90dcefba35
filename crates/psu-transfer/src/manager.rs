//! Transfer session ownership and message handling
//!
//! The manager owns every incoming and outgoing session, keyed by
//! `(peer, file_hash)`, plus the set of files this node provides. All
//! `File*` payloads from a peer go through [`TransferManager::handle`].

use crate::error::{Result, TransferError};
use crate::sender::{OutgoingTransfer, RetryPolicy};
use crate::session::{FileTransferSession, TransferState};
use crate::DEFAULT_CHUNK_SIZE;
use psu_crypto::hashing::content_hash;
use psu_protocol::payload::{
    FileAvailabilityResponse, FileCancel, FileError, FileRequest, FileRequestResponse,
};
use psu_protocol::{NodeId, Payload};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type SessionKey = (NodeId, String);

/// Transfer tunables
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: u32,
    pub retry: RetryPolicy,
    /// Sessions without activity for this long are dropped
    pub idle_timeout: Duration,
    /// Limit on incoming plus outgoing sessions
    pub max_sessions: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(120),
            max_sessions: 64,
        }
    }
}

/// A session that reached a terminal state while handling a message
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Verified content received
    Received {
        peer: NodeId,
        file_hash: String,
        data: Vec<u8>,
    },
    /// Every chunk we sent was acknowledged
    Sent { peer: NodeId, file_hash: String },
    Failed {
        peer: NodeId,
        file_hash: String,
        reason: String,
    },
    Cancelled { peer: NodeId, file_hash: String },
}

/// Messages to send back to the peer and any finished session
#[derive(Debug, Default)]
pub struct TransferReply {
    pub responses: Vec<Payload>,
    pub event: Option<TransferEvent>,
}

impl TransferReply {
    fn respond(payload: Payload) -> Self {
        Self {
            responses: vec![payload],
            event: None,
        }
    }

    fn event(event: TransferEvent) -> Self {
        Self {
            responses: Vec::new(),
            event: Some(event),
        }
    }
}

struct SharedFile {
    content: Arc<Vec<u8>>,
    metadata: BTreeMap<String, String>,
}

/// Owner of all file transfer sessions on a node
pub struct TransferManager {
    config: TransferConfig,
    shared: RwLock<HashMap<String, SharedFile>>,
    incoming: RwLock<HashMap<SessionKey, FileTransferSession>>,
    outgoing: RwLock<HashMap<SessionKey, OutgoingTransfer>>,
}

impl TransferManager {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            shared: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
            outgoing: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Offer content to peers; returns its content hash
    pub async fn share_file(&self, content: Vec<u8>, metadata: BTreeMap<String, String>) -> String {
        let file_hash = content_hash(&content);
        debug!("Sharing {} ({} bytes)", file_hash, content.len());
        self.shared.write().await.insert(
            file_hash.clone(),
            SharedFile {
                content: Arc::new(content),
                metadata,
            },
        );
        file_hash
    }

    pub async fn unshare_file(&self, file_hash: &str) -> bool {
        self.shared.write().await.remove(file_hash).is_some()
    }

    pub async fn is_shared(&self, file_hash: &str) -> bool {
        self.shared.read().await.contains_key(file_hash)
    }

    async fn session_count(&self) -> usize {
        self.incoming.read().await.len() + self.outgoing.read().await.len()
    }

    /// Start receiving `file_hash` from `peer`
    pub async fn request_file(&self, peer: NodeId, file_hash: &str) -> Result<FileRequest> {
        if self.session_count().await >= self.config.max_sessions {
            return Err(TransferError::TooManySessions(self.config.max_sessions));
        }
        let mut incoming = self.incoming.write().await;
        let key = (peer, file_hash.to_string());
        if incoming.contains_key(&key) {
            return Err(TransferError::SessionExists(file_hash.to_string()));
        }
        incoming.insert(key, FileTransferSession::new(peer, file_hash));
        info!("Requesting {} from {}", file_hash, peer);
        Ok(FileRequest {
            file_hash: file_hash.to_string(),
        })
    }

    /// State of our incoming session for `file_hash` from `peer`
    pub async fn session_state(&self, peer: &NodeId, file_hash: &str) -> Option<TransferState> {
        self.incoming
            .read()
            .await
            .get(&(*peer, file_hash.to_string()))
            .map(|session| session.state())
    }

    /// Received chunk indices of an incoming session
    pub async fn received_indices(&self, peer: &NodeId, file_hash: &str) -> Option<Vec<u32>> {
        self.incoming
            .read()
            .await
            .get(&(*peer, file_hash.to_string()))
            .map(|session| session.received_indices())
    }

    pub async fn active_sessions(&self) -> (usize, usize) {
        (
            self.incoming.read().await.len(),
            self.outgoing.read().await.len(),
        )
    }

    /// Handle one file transfer payload from `peer`
    ///
    /// Errors that end a session (integrity failure) remove it before
    /// returning; the caller reports them to the peer.
    pub async fn handle(&self, peer: NodeId, payload: &Payload) -> Result<TransferReply> {
        match payload {
            Payload::FileRequest(request) => self.on_request(peer, request).await,
            Payload::FileRequestResponse(response) => {
                let key = (peer, response.file_hash.clone());
                let mut incoming = self.incoming.write().await;
                let session = incoming
                    .get_mut(&key)
                    .ok_or_else(|| TransferError::SessionNotFound(response.file_hash.clone()))?;
                match session.on_request_response(response) {
                    Ok(()) => Ok(TransferReply::default()),
                    Err(TransferError::FileNotFound(file_hash)) => {
                        let reason = session.failure().unwrap_or("not available").to_string();
                        incoming.remove(&key);
                        debug!("{} does not provide {}: {}", peer, file_hash, reason);
                        Ok(TransferReply::event(TransferEvent::Failed {
                            peer,
                            file_hash,
                            reason,
                        }))
                    }
                    Err(e) => Err(e),
                }
            }
            Payload::FileChunkStart(start) => {
                let mut incoming = self.incoming.write().await;
                let session = incoming
                    .get_mut(&(peer, start.file_hash.clone()))
                    .ok_or_else(|| TransferError::SessionNotFound(start.file_hash.clone()))?;
                session.on_chunk_start(start)?;
                Ok(TransferReply::default())
            }
            Payload::FileChunk(chunk) => {
                let mut incoming = self.incoming.write().await;
                let session = incoming
                    .get_mut(&(peer, chunk.file_hash.clone()))
                    .ok_or_else(|| TransferError::SessionNotFound(chunk.file_hash.clone()))?;
                let ack = session.on_chunk(chunk)?;
                Ok(TransferReply::respond(Payload::FileChunkAck(ack)))
            }
            Payload::FileChunkAck(ack) => {
                let key = (peer, ack.file_hash.clone());
                let mut outgoing = self.outgoing.write().await;
                let transfer = outgoing
                    .get_mut(&key)
                    .ok_or_else(|| TransferError::SessionNotFound(ack.file_hash.clone()))?;
                transfer.on_ack(ack);

                if let Some(complete) = transfer.complete_message() {
                    outgoing.remove(&key);
                    info!("All chunks of {} acknowledged by {}", ack.file_hash, peer);
                    return Ok(TransferReply {
                        responses: vec![Payload::FileComplete(complete)],
                        event: Some(TransferEvent::Sent {
                            peer,
                            file_hash: ack.file_hash.clone(),
                        }),
                    });
                }

                match transfer.poll_chunks(Instant::now()) {
                    Ok(chunks) => Ok(TransferReply {
                        responses: chunks.into_iter().map(Payload::FileChunk).collect(),
                        event: None,
                    }),
                    Err(e) => {
                        outgoing.remove(&key);
                        Err(e)
                    }
                }
            }
            Payload::FileComplete(complete) => {
                let key = (peer, complete.file_hash.clone());
                let mut incoming = self.incoming.write().await;
                let session = incoming
                    .get_mut(&key)
                    .ok_or_else(|| TransferError::SessionNotFound(complete.file_hash.clone()))?;
                match session.on_complete(complete) {
                    Ok(data) => {
                        incoming.remove(&key);
                        Ok(TransferReply::event(TransferEvent::Received {
                            peer,
                            file_hash: complete.file_hash.clone(),
                            data,
                        }))
                    }
                    Err(e) => {
                        if e.is_fatal() {
                            incoming.remove(&key);
                        }
                        Err(e)
                    }
                }
            }
            Payload::FileError(error) => Ok(self.on_remote_error(peer, error).await),
            Payload::FileCancel(cancel) => Ok(self.on_remote_cancel(peer, cancel).await),
            Payload::FileAvailabilityQuery(query) => {
                let shared = self.shared.read().await;
                let available = query
                    .file_hashes
                    .iter()
                    .filter(|hash| shared.contains_key(hash.as_str()))
                    .cloned()
                    .collect();
                Ok(TransferReply::respond(Payload::FileAvailabilityResponse(
                    FileAvailabilityResponse { available },
                )))
            }
            Payload::FileAvailabilityResponse(response) => {
                debug!("{} provides {} of the queried files", peer, response.available.len());
                Ok(TransferReply::default())
            }
            other => Err(TransferError::UnexpectedMessage(other.message_type())),
        }
    }

    async fn on_request(&self, peer: NodeId, request: &FileRequest) -> Result<TransferReply> {
        let shared = self.shared.read().await;
        let Some(file) = shared.get(&request.file_hash) else {
            debug!("{} requested unknown file {}", peer, request.file_hash);
            return Ok(TransferReply::respond(Payload::FileRequestResponse(
                FileRequestResponse {
                    file_hash: request.file_hash.clone(),
                    available: false,
                    total_size: 0,
                    chunk_size: 0,
                    total_chunks: 0,
                    error_message: Some("file not available".to_string()),
                    metadata: BTreeMap::new(),
                },
            )));
        };

        let key = (peer, request.file_hash.clone());
        let restart = self.outgoing.read().await.contains_key(&key);
        if !restart && self.session_count().await >= self.config.max_sessions {
            return Err(TransferError::TooManySessions(self.config.max_sessions));
        }

        let mut transfer = OutgoingTransfer::with_hash(
            peer,
            request.file_hash.clone(),
            file.content.clone(),
            self.config.chunk_size,
            self.config.retry.clone(),
        )?;
        let response = FileRequestResponse {
            file_hash: request.file_hash.clone(),
            available: true,
            total_size: file.content.len() as u64,
            chunk_size: self.config.chunk_size.max(1),
            total_chunks: transfer.total_chunks(),
            error_message: None,
            metadata: file.metadata.clone(),
        };
        drop(shared);

        let start = transfer.start();
        let mut responses = vec![
            Payload::FileRequestResponse(response),
            Payload::FileChunkStart(start),
        ];
        // Nothing to acknowledge for empty content
        if let Some(complete) = transfer.complete_message() {
            responses.push(Payload::FileComplete(complete));
            return Ok(TransferReply {
                responses,
                event: Some(TransferEvent::Sent {
                    peer,
                    file_hash: request.file_hash.clone(),
                }),
            });
        }
        let chunks = transfer.poll_chunks(Instant::now())?;
        responses.extend(chunks.into_iter().map(Payload::FileChunk));

        if restart {
            debug!("Restarting transfer of {} to {}", request.file_hash, peer);
        }
        info!(
            "Sending {} to {} in {} chunks",
            request.file_hash,
            peer,
            transfer.total_chunks()
        );
        self.outgoing.write().await.insert(key, transfer);
        Ok(TransferReply {
            responses,
            event: None,
        })
    }

    async fn on_remote_error(&self, peer: NodeId, error: &FileError) -> TransferReply {
        let key = (peer, error.file_hash.clone());
        let reason = format!("{:?}: {}", error.code, error.reason);
        let removed_outgoing = self.outgoing.write().await.remove(&key).is_some();
        let removed_incoming = match self.incoming.write().await.remove(&key) {
            Some(mut session) => {
                session.on_error(error);
                true
            }
            None => false,
        };
        if !removed_outgoing && !removed_incoming {
            debug!("File error from {} for unknown transfer {}", peer, error.file_hash);
            return TransferReply::default();
        }
        warn!("Transfer of {} with {} failed: {}", error.file_hash, peer, reason);
        TransferReply::event(TransferEvent::Failed {
            peer,
            file_hash: error.file_hash.clone(),
            reason,
        })
    }

    async fn on_remote_cancel(&self, peer: NodeId, cancel: &FileCancel) -> TransferReply {
        let key = (peer, cancel.file_hash.clone());
        let removed_outgoing = match self.outgoing.write().await.remove(&key) {
            Some(mut transfer) => {
                transfer.cancel();
                true
            }
            None => false,
        };
        let removed_incoming = match self.incoming.write().await.remove(&key) {
            Some(mut session) => {
                session.on_cancel(cancel);
                true
            }
            None => false,
        };
        if !removed_outgoing && !removed_incoming {
            return TransferReply::default();
        }
        info!("Transfer of {} cancelled by {}", cancel.file_hash, peer);
        TransferReply::event(TransferEvent::Cancelled {
            peer,
            file_hash: cancel.file_hash.clone(),
        })
    }

    /// Cancel our side of a transfer; returns the notice for the peer
    pub async fn cancel(
        &self,
        peer: NodeId,
        file_hash: &str,
        reason: Option<String>,
    ) -> Result<FileCancel> {
        let key = (peer, file_hash.to_string());
        if let Some(mut session) = self.incoming.write().await.remove(&key) {
            if let Some(cancel) = session.cancel(reason.clone()) {
                return Ok(cancel);
            }
        }
        if let Some(mut transfer) = self.outgoing.write().await.remove(&key) {
            transfer.cancel();
            return Ok(FileCancel {
                file_hash: file_hash.to_string(),
                reason,
            });
        }
        Err(TransferError::SessionNotFound(file_hash.to_string()))
    }

    /// Retransmissions due now, and errors for transfers out of retries
    pub async fn poll_retransmissions(&self) -> Vec<(NodeId, Payload)> {
        self.poll_retransmissions_at(Instant::now()).await
    }

    pub async fn poll_retransmissions_at(&self, now: Instant) -> Vec<(NodeId, Payload)> {
        let mut outbound = Vec::new();
        let mut outgoing = self.outgoing.write().await;
        let mut failed = Vec::new();

        for (key, transfer) in outgoing.iter_mut() {
            match transfer.poll_chunks(now) {
                Ok(chunks) => {
                    outbound.extend(chunks.into_iter().map(|c| (key.0, Payload::FileChunk(c))));
                }
                Err(e) => {
                    outbound.push((
                        key.0,
                        Payload::FileError(FileError {
                            file_hash: key.1.clone(),
                            code: e.error_code(),
                            reason: e.to_string(),
                        }),
                    ));
                    failed.push(key.clone());
                }
            }
        }
        for key in failed {
            outgoing.remove(&key);
        }
        outbound
    }

    /// Earliest pending retransmission across all outgoing transfers
    pub async fn next_deadline(&self) -> Option<Instant> {
        self.outgoing
            .read()
            .await
            .values()
            .filter_map(|transfer| transfer.next_deadline())
            .min()
    }

    /// Drop sessions idle past the configured timeout
    pub async fn sweep_idle(&self) -> Vec<(NodeId, String)> {
        self.sweep_idle_at(Instant::now()).await
    }

    pub async fn sweep_idle_at(&self, now: Instant) -> Vec<(NodeId, String)> {
        let timeout = self.config.idle_timeout;
        let mut removed = Vec::new();

        self.incoming.write().await.retain(|key, session| {
            let keep = session.idle_for(now) < timeout;
            if !keep {
                removed.push(key.clone());
            }
            keep
        });
        self.outgoing.write().await.retain(|key, transfer| {
            let keep = transfer.idle_for(now) < timeout;
            if !keep {
                removed.push(key.clone());
            }
            keep
        });

        if !removed.is_empty() {
            info!("Dropped {} idle transfer sessions", removed.len());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psu_crypto::NODE_ID_SIZE;
    use psu_protocol::payload::{FileAvailabilityQuery, FileChunk, FileComplete};
    use psu_protocol::ErrorCode;

    fn peer(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_SIZE])
    }

    fn manager() -> TransferManager {
        TransferManager::new(TransferConfig {
            chunk_size: 4,
            retry: RetryPolicy {
                ack_timeout: Duration::from_millis(100),
                max_backoff: Duration::from_millis(400),
                max_retries: 1,
                max_in_flight: 8,
            },
            ..TransferConfig::default()
        })
    }

    #[tokio::test]
    async fn test_request_unknown_file() {
        let provider = manager();
        let reply = provider
            .handle(
                peer(1),
                &Payload::FileRequest(FileRequest {
                    file_hash: "missing".to_string(),
                }),
            )
            .await
            .unwrap();
        assert!(matches!(
            reply.responses.as_slice(),
            [Payload::FileRequestResponse(r)] if !r.available
        ));
    }

    #[tokio::test]
    async fn test_request_shared_file_sends_header_and_chunks() {
        let provider = manager();
        let hash = provider.share_file(b"0123456789".to_vec(), BTreeMap::new()).await;

        let reply = provider
            .handle(peer(1), &Payload::FileRequest(FileRequest { file_hash: hash }))
            .await
            .unwrap();
        assert_eq!(reply.responses.len(), 5);
        assert!(matches!(reply.responses[0], Payload::FileRequestResponse(ref r) if r.available && r.total_chunks == 3));
        assert!(matches!(reply.responses[1], Payload::FileChunkStart(_)));
        assert_eq!(provider.active_sessions().await, (0, 1));
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected() {
        let receiver = manager();
        receiver.request_file(peer(1), "abc").await.unwrap();
        assert!(matches!(
            receiver.request_file(peer(1), "abc").await,
            Err(TransferError::SessionExists(_))
        ));
        // Same file from another peer is a separate session
        assert!(receiver.request_file(peer(2), "abc").await.is_ok());
    }

    #[tokio::test]
    async fn test_chunk_without_session() {
        let receiver = manager();
        let result = receiver
            .handle(
                peer(1),
                &Payload::FileChunk(FileChunk {
                    file_hash: "abc".to_string(),
                    chunk_index: 0,
                    data: vec![1],
                }),
            )
            .await;
        assert!(matches!(result, Err(TransferError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_unavailable_response_ends_session() {
        let receiver = manager();
        receiver.request_file(peer(1), "abc").await.unwrap();
        let reply = receiver
            .handle(
                peer(1),
                &Payload::FileRequestResponse(FileRequestResponse {
                    file_hash: "abc".to_string(),
                    available: false,
                    total_size: 0,
                    chunk_size: 0,
                    total_chunks: 0,
                    error_message: Some("gone".to_string()),
                    metadata: BTreeMap::new(),
                }),
            )
            .await
            .unwrap();
        assert!(matches!(reply.event, Some(TransferEvent::Failed { ref reason, .. }) if reason == "gone"));
        assert!(receiver.session_state(&peer(1), "abc").await.is_none());
    }

    #[tokio::test]
    async fn test_retransmission_then_failure() {
        let provider = manager();
        let hash = provider.share_file(b"0123".to_vec(), BTreeMap::new()).await;
        provider
            .handle(peer(1), &Payload::FileRequest(FileRequest { file_hash: hash.clone() }))
            .await
            .unwrap();

        let deadline = provider.next_deadline().await.unwrap();
        let resent = provider.poll_retransmissions_at(deadline).await;
        assert!(matches!(resent.as_slice(), [(p, Payload::FileChunk(_))] if *p == peer(1)));

        let deadline = provider.next_deadline().await.unwrap();
        let failed = provider.poll_retransmissions_at(deadline).await;
        assert!(matches!(
            failed.as_slice(),
            [(_, Payload::FileError(e))] if e.code == ErrorCode::PeerUnreachable && e.file_hash == hash
        ));
        assert_eq!(provider.active_sessions().await, (0, 0));
    }

    #[tokio::test]
    async fn test_remote_cancel_removes_session() {
        let receiver = manager();
        receiver.request_file(peer(1), "abc").await.unwrap();
        let reply = receiver
            .handle(
                peer(1),
                &Payload::FileCancel(FileCancel {
                    file_hash: "abc".to_string(),
                    reason: Some("shutting down".to_string()),
                }),
            )
            .await
            .unwrap();
        assert!(matches!(reply.event, Some(TransferEvent::Cancelled { .. })));
        assert_eq!(receiver.active_sessions().await, (0, 0));
    }

    #[tokio::test]
    async fn test_local_cancel() {
        let receiver = manager();
        receiver.request_file(peer(1), "abc").await.unwrap();
        let cancel = receiver.cancel(peer(1), "abc", None).await.unwrap();
        assert_eq!(cancel.file_hash, "abc");
        assert!(matches!(
            receiver.cancel(peer(1), "abc", None).await,
            Err(TransferError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_availability_query() {
        let provider = manager();
        let hash = provider.share_file(b"data".to_vec(), BTreeMap::new()).await;
        let reply = provider
            .handle(
                peer(1),
                &Payload::FileAvailabilityQuery(FileAvailabilityQuery {
                    file_hashes: vec!["other".to_string(), hash.clone()],
                }),
            )
            .await
            .unwrap();
        assert!(matches!(
            reply.responses.as_slice(),
            [Payload::FileAvailabilityResponse(r)] if r.available == vec![hash.clone()]
        ));
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let receiver = manager();
        receiver.request_file(peer(1), "abc").await.unwrap();
        assert!(receiver.sweep_idle().await.is_empty());

        let later = Instant::now() + Duration::from_secs(121);
        let removed = receiver.sweep_idle_at(later).await;
        assert_eq!(removed, vec![(peer(1), "abc".to_string())]);
    }

    #[tokio::test]
    async fn test_empty_file_completes_immediately() {
        let provider = manager();
        let hash = provider.share_file(Vec::new(), BTreeMap::new()).await;
        let reply = provider
            .handle(peer(1), &Payload::FileRequest(FileRequest { file_hash: hash.clone() }))
            .await
            .unwrap();
        assert!(matches!(reply.responses.last(), Some(Payload::FileComplete(FileComplete { file_hash })) if *file_hash == hash));
        assert!(matches!(reply.event, Some(TransferEvent::Sent { .. })));
    }

    #[tokio::test]
    async fn test_unexpected_payload() {
        let provider = manager();
        let result = provider
            .handle(peer(1), &Payload::Ping(psu_protocol::payload::Ping))
            .await;
        assert!(matches!(result, Err(TransferError::UnexpectedMessage(_))));
    }
}
