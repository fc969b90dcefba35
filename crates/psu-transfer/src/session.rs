//! Receiving side of a file transfer
//!
//! `Requested -> Transferring -> Completed`, with `Cancelled` and `Errored`
//! reachable from any non-terminal state. Completion requires every chunk
//! index in `[0, total_chunks)` and a matching SHA-256 of the assembled
//! content.

use crate::error::{Result, TransferError};
use psu_crypto::hashing::content_hash_chunks;
use psu_protocol::payload::{
    FileCancel, FileChunk, FileChunkAck, FileChunkStart, FileComplete, FileError,
    FileRequestResponse,
};
use psu_protocol::NodeId;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Receiver session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Transferring,
    Completed,
    Cancelled,
    Errored,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Errored
        )
    }

    fn name(self) -> &'static str {
        match self {
            TransferState::Requested => "requested",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Cancelled => "cancelled",
            TransferState::Errored => "errored",
        }
    }
}

/// Number of chunks needed for `total_size` bytes
///
/// `None` when the count does not fit the wire's `u32` chunk index.
pub fn chunk_count(total_size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return Some(0);
    }
    u32::try_from(total_size.div_ceil(chunk_size as u64)).ok()
}

/// An incoming transfer from one peer
#[derive(Debug)]
pub struct FileTransferSession {
    peer: NodeId,
    file_hash: String,
    total_size: u64,
    chunk_size: u32,
    total_chunks: u32,
    /// Received chunk data by index
    chunks: BTreeMap<u32, Vec<u8>>,
    state: TransferState,
    last_activity: Instant,
    failure: Option<String>,
}

impl FileTransferSession {
    /// A session for a file we just asked for
    pub fn new(peer: NodeId, file_hash: impl Into<String>) -> Self {
        Self {
            peer,
            file_hash: file_hash.into(),
            total_size: 0,
            chunk_size: 0,
            total_chunks: 0,
            chunks: BTreeMap::new(),
            state: TransferState::Requested,
            last_activity: Instant::now(),
            failure: None,
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Indices received so far, ascending
    pub fn received_indices(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }

    /// Fraction of chunks received
    pub fn progress(&self) -> f32 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.chunks.len() as f32 / self.total_chunks as f32
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn invalid(&self, event: &'static str) -> TransferError {
        TransferError::InvalidState {
            state: self.state.name(),
            event,
        }
    }

    fn fail(&mut self, reason: String) {
        self.state = TransferState::Errored;
        self.failure = Some(reason);
    }

    /// Provider's answer to our request
    pub fn on_request_response(&mut self, response: &FileRequestResponse) -> Result<()> {
        if self.state != TransferState::Requested {
            return Err(self.invalid("request response"));
        }
        self.touch();
        if !response.available {
            let reason = response
                .error_message
                .clone()
                .unwrap_or_else(|| "not available".to_string());
            self.fail(reason);
            return Err(TransferError::FileNotFound(self.file_hash.clone()));
        }
        Ok(())
    }

    /// Transfer header; moves to `Transferring`
    pub fn on_chunk_start(&mut self, start: &FileChunkStart) -> Result<()> {
        if self.state != TransferState::Requested {
            return Err(self.invalid("chunk start"));
        }
        let header_error = |reason: &str| TransferError::InvalidHeader {
            file_hash: start.file_hash.clone(),
            reason: reason.to_string(),
        };
        if start.file_hash != self.file_hash {
            return Err(header_error("file hash does not match request"));
        }
        if start.total_size > 0 && start.chunk_size == 0 {
            return Err(header_error("zero chunk size"));
        }
        match chunk_count(start.total_size, start.chunk_size) {
            Some(expected) if expected == start.total_chunks => {}
            Some(_) => return Err(header_error("chunk count does not cover size")),
            None => return Err(header_error("too many chunks")),
        }

        self.total_size = start.total_size;
        self.chunk_size = start.chunk_size;
        self.total_chunks = start.total_chunks;
        self.state = TransferState::Transferring;
        self.touch();
        debug!(
            "Receiving {} from {}: {} bytes in {} chunks",
            self.file_hash, self.peer, self.total_size, self.total_chunks
        );
        Ok(())
    }

    fn expected_len(&self, index: u32) -> usize {
        let offset = index as u64 * self.chunk_size as u64;
        (self.total_size - offset).min(self.chunk_size as u64) as usize
    }

    /// Store a chunk and produce its acknowledgement
    ///
    /// Duplicates are acknowledged again without touching stored data.
    pub fn on_chunk(&mut self, chunk: &FileChunk) -> Result<FileChunkAck> {
        if self.state != TransferState::Transferring {
            return Err(self.invalid("chunk"));
        }
        if chunk.chunk_index >= self.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                file_hash: self.file_hash.clone(),
                index: chunk.chunk_index,
                total: self.total_chunks,
            });
        }
        let expected = self.expected_len(chunk.chunk_index);
        if chunk.data.len() != expected {
            return Err(TransferError::ChunkLength {
                file_hash: self.file_hash.clone(),
                index: chunk.chunk_index,
                expected,
                actual: chunk.data.len(),
            });
        }

        self.touch();
        if self.chunks.contains_key(&chunk.chunk_index) {
            debug!("Duplicate chunk {} of {}", chunk.chunk_index, self.file_hash);
        } else {
            self.chunks.insert(chunk.chunk_index, chunk.data.clone());
        }

        Ok(FileChunkAck {
            file_hash: self.file_hash.clone(),
            chunk_index: chunk.chunk_index,
        })
    }

    /// Verify and assemble the content
    ///
    /// Missing chunks leave the session `Transferring`. A hash mismatch is
    /// fatal: the session moves to `Errored`.
    pub fn on_complete(&mut self, complete: &FileComplete) -> Result<Vec<u8>> {
        if self.state != TransferState::Transferring {
            return Err(self.invalid("complete"));
        }
        if complete.file_hash != self.file_hash {
            return Err(TransferError::InvalidHeader {
                file_hash: complete.file_hash.clone(),
                reason: "completion for another file".to_string(),
            });
        }

        let missing = self.total_chunks - self.chunks.len() as u32;
        if missing > 0 {
            return Err(TransferError::Incomplete {
                file_hash: self.file_hash.clone(),
                missing,
            });
        }

        let actual = content_hash_chunks(self.chunks.values().map(Vec::as_slice));
        if actual != self.file_hash {
            warn!(
                "Integrity check failed for {} from {}",
                self.file_hash, self.peer
            );
            self.fail(format!("content hashes to {}", actual));
            self.chunks.clear();
            return Err(TransferError::Integrity {
                file_hash: self.file_hash.clone(),
                actual,
            });
        }

        let mut content = Vec::with_capacity(self.total_size as usize);
        for data in self.chunks.values() {
            content.extend_from_slice(data);
        }
        self.chunks.clear();
        self.state = TransferState::Completed;
        info!(
            "Received {} from {} ({} bytes)",
            self.file_hash,
            self.peer,
            content.len()
        );
        Ok(content)
    }

    /// The sender cancelled
    pub fn on_cancel(&mut self, cancel: &FileCancel) {
        if !self.state.is_terminal() {
            debug!("Transfer {} cancelled by peer: {:?}", self.file_hash, cancel.reason);
            self.state = TransferState::Cancelled;
            self.chunks.clear();
        }
    }

    /// The sender reported an error
    pub fn on_error(&mut self, error: &FileError) {
        if !self.state.is_terminal() {
            self.fail(format!("{:?}: {}", error.code, error.reason));
            self.chunks.clear();
        }
    }

    /// Cancel locally; returns the message for the peer
    pub fn cancel(&mut self, reason: Option<String>) -> Option<FileCancel> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = TransferState::Cancelled;
        self.chunks.clear();
        Some(FileCancel {
            file_hash: self.file_hash.clone(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psu_crypto::hashing::content_hash;
    use psu_crypto::NODE_ID_SIZE;
    use psu_protocol::ErrorCode;

    const CHUNK: u32 = 4;

    fn content() -> Vec<u8> {
        b"0123456789".to_vec()
    }

    fn started_session() -> FileTransferSession {
        let data = content();
        let hash = content_hash(&data);
        let mut session = FileTransferSession::new(NodeId::from_bytes([1; NODE_ID_SIZE]), hash.clone());
        session
            .on_chunk_start(&FileChunkStart {
                file_hash: hash,
                total_size: data.len() as u64,
                chunk_size: CHUNK,
                total_chunks: chunk_count(data.len() as u64, CHUNK).unwrap(),
            })
            .unwrap();
        session
    }

    fn chunk(session: &FileTransferSession, index: u32, data: &[u8]) -> FileChunk {
        FileChunk {
            file_hash: session.file_hash().to_string(),
            chunk_index: index,
            data: data.to_vec(),
        }
    }

    fn complete(session: &FileTransferSession) -> FileComplete {
        FileComplete {
            file_hash: session.file_hash().to_string(),
        }
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 4), Some(0));
        assert_eq!(chunk_count(4, 4), Some(1));
        assert_eq!(chunk_count(5, 4), Some(2));
        assert_eq!(chunk_count(10, 4), Some(3));
        assert_eq!(chunk_count(u32::MAX as u64, 1), Some(u32::MAX));
        assert_eq!(chunk_count(u32::MAX as u64 + 1, 1), None);
    }

    #[test]
    fn test_out_of_order_chunks_complete() {
        let mut session = started_session();
        assert_eq!(session.state(), TransferState::Transferring);

        for (index, data) in [(2u32, &b"89"[..]), (0, b"0123"), (1, b"4567")] {
            let ack = session.on_chunk(&chunk(&session, index, data)).unwrap();
            assert_eq!(ack.chunk_index, index);
        }
        assert_eq!(session.received_indices(), vec![0, 1, 2]);

        let data = session.on_complete(&complete(&session)).unwrap();
        assert_eq!(data, content());
        assert_eq!(session.state(), TransferState::Completed);
    }

    #[test]
    fn test_duplicate_chunk_reacked() {
        let mut session = started_session();
        session.on_chunk(&chunk(&session, 0, b"0123")).unwrap();
        let ack = session.on_chunk(&chunk(&session, 0, b"0123")).unwrap();
        assert_eq!(ack.chunk_index, 0);
        assert_eq!(session.received_indices(), vec![0]);
    }

    #[test]
    fn test_out_of_range_chunk() {
        let mut session = started_session();
        let result = session.on_chunk(&chunk(&session, 3, b"xx"));
        assert!(matches!(
            result,
            Err(TransferError::ChunkOutOfRange { index: 3, total: 3, .. })
        ));
    }

    #[test]
    fn test_wrong_chunk_length() {
        let mut session = started_session();
        assert!(matches!(
            session.on_chunk(&chunk(&session, 2, b"899")),
            Err(TransferError::ChunkLength { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn test_complete_with_missing_chunks() {
        let mut session = started_session();
        session.on_chunk(&chunk(&session, 0, b"0123")).unwrap();
        assert!(matches!(
            session.on_complete(&complete(&session)),
            Err(TransferError::Incomplete { missing: 2, .. })
        ));
        assert_eq!(session.state(), TransferState::Transferring);
    }

    #[test]
    fn test_corrupted_chunk_fails_integrity() {
        let mut session = started_session();
        session.on_chunk(&chunk(&session, 0, b"0123")).unwrap();
        session.on_chunk(&chunk(&session, 1, b"4X67")).unwrap();
        session.on_chunk(&chunk(&session, 2, b"89")).unwrap();

        let err = session.on_complete(&complete(&session)).unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));
        assert!(err.is_fatal());
        assert_eq!(session.state(), TransferState::Errored);

        // Terminal: no further chunks accepted
        assert!(session.on_chunk(&chunk(&session, 0, b"0123")).is_err());
    }

    #[test]
    fn test_header_must_cover_size() {
        let mut session = FileTransferSession::new(NodeId::from_bytes([1; NODE_ID_SIZE]), "abc");
        let result = session.on_chunk_start(&FileChunkStart {
            file_hash: "abc".to_string(),
            total_size: 10,
            chunk_size: 4,
            total_chunks: 2,
        });
        assert!(matches!(result, Err(TransferError::InvalidHeader { .. })));
        assert_eq!(session.state(), TransferState::Requested);
    }

    #[test]
    fn test_header_with_unindexable_chunk_count_rejected() {
        let mut session = FileTransferSession::new(NodeId::from_bytes([1; NODE_ID_SIZE]), "abc");
        let total_size = (u32::MAX as u64 + 1) * 2;
        let result = session.on_chunk_start(&FileChunkStart {
            file_hash: "abc".to_string(),
            total_size,
            chunk_size: 1,
            // What a truncating cast of the real count would yield
            total_chunks: total_size as u32,
        });
        match result {
            Err(TransferError::InvalidHeader { reason, .. }) => assert_eq!(reason, "too many chunks"),
            other => panic!("expected InvalidHeader, got {:?}", other),
        }
        assert_eq!(session.state(), TransferState::Requested);
    }

    #[test]
    fn test_empty_file() {
        let hash = content_hash(b"");
        let mut session = FileTransferSession::new(NodeId::from_bytes([1; NODE_ID_SIZE]), hash.clone());
        session
            .on_chunk_start(&FileChunkStart {
                file_hash: hash.clone(),
                total_size: 0,
                chunk_size: CHUNK,
                total_chunks: 0,
            })
            .unwrap();
        let data = session.on_complete(&FileComplete { file_hash: hash }).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_cancel_and_error_are_terminal() {
        let mut session = started_session();
        session.on_cancel(&FileCancel {
            file_hash: session.file_hash().to_string(),
            reason: None,
        });
        assert_eq!(session.state(), TransferState::Cancelled);
        assert!(session.cancel(None).is_none());

        let mut session = started_session();
        session.on_error(&FileError {
            file_hash: session.file_hash().to_string(),
            code: ErrorCode::Internal,
            reason: "disk".to_string(),
        });
        assert_eq!(session.state(), TransferState::Errored);
        assert!(session.failure().is_some());
    }

    #[test]
    fn test_unavailable_file() {
        let mut session = FileTransferSession::new(NodeId::from_bytes([1; NODE_ID_SIZE]), "abc");
        let result = session.on_request_response(&FileRequestResponse {
            file_hash: "abc".to_string(),
            available: false,
            total_size: 0,
            chunk_size: 0,
            total_chunks: 0,
            error_message: None,
            metadata: Default::default(),
        });
        assert!(matches!(result, Err(TransferError::FileNotFound(_))));
        assert_eq!(session.state(), TransferState::Errored);
    }
}
