//! Sending side of a file transfer
//!
//! Content is split into fixed-size chunks. Each chunk stays unacknowledged
//! until the receiver acks its index; a chunk whose ack does not arrive in
//! time is sent again after an exponentially growing delay, up to a bounded
//! number of retransmissions.

use crate::error::{Result, TransferError};
use crate::session::chunk_count;
use psu_crypto::hashing::content_hash;
use psu_protocol::payload::{FileChunk, FileChunkAck, FileChunkStart, FileComplete};
use psu_protocol::NodeId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Retransmission policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wait for the first ack; doubles on every retransmission
    pub ack_timeout: Duration,

    /// Upper bound on the wait between retransmissions
    pub max_backoff: Duration,

    /// Retransmissions per chunk before the transfer fails
    pub max_retries: u32,

    /// Chunks sent but not yet acknowledged
    pub max_in_flight: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_retries: 5,
            max_in_flight: 16,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th send of a chunk (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.ack_timeout.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }
}

/// Sender progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Created, header not yet sent
    Pending,
    Sending,
    /// Every chunk acknowledged
    Acknowledged,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChunkSlot {
    acked: bool,
    sends: u32,
    deadline: Option<Instant>,
}

/// An outgoing transfer to one peer
#[derive(Debug)]
pub struct OutgoingTransfer {
    peer: NodeId,
    file_hash: String,
    content: Arc<Vec<u8>>,
    chunk_size: u32,
    slots: Vec<ChunkSlot>,
    policy: RetryPolicy,
    state: SenderState,
    last_activity: Instant,
}

impl OutgoingTransfer {
    pub fn new(
        peer: NodeId,
        content: Arc<Vec<u8>>,
        chunk_size: u32,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let file_hash = content_hash(&content);
        Self::with_hash(peer, file_hash, content, chunk_size, policy)
    }

    /// For content whose hash is already known
    ///
    /// Fails when the content needs more chunks than a `u32` index covers.
    pub fn with_hash(
        peer: NodeId,
        file_hash: String,
        content: Arc<Vec<u8>>,
        chunk_size: u32,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let chunk_size = chunk_size.max(1);
        let Some(total) = chunk_count(content.len() as u64, chunk_size) else {
            return Err(TransferError::InvalidHeader {
                file_hash,
                reason: "too many chunks".to_string(),
            });
        };
        Ok(Self {
            peer,
            file_hash,
            content,
            chunk_size,
            slots: vec![ChunkSlot::default(); total as usize],
            policy,
            state: SenderState::Pending,
            last_activity: Instant::now(),
        })
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn total_chunks(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Header announcing the transfer
    pub fn start(&mut self) -> FileChunkStart {
        self.state = SenderState::Sending;
        self.last_activity = Instant::now();
        FileChunkStart {
            file_hash: self.file_hash.clone(),
            total_size: self.content.len() as u64,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks(),
        }
    }

    fn chunk(&self, index: u32) -> FileChunk {
        let start = index as usize * self.chunk_size as usize;
        let end = (start + self.chunk_size as usize).min(self.content.len());
        FileChunk {
            file_hash: self.file_hash.clone(),
            chunk_index: index,
            data: self.content[start..end].to_vec(),
        }
    }

    fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.acked && slot.sends > 0)
            .count()
    }

    /// Chunks due at `now`: retransmissions first, then new chunks up to
    /// the in-flight limit
    ///
    /// A chunk whose retries are used up fails the whole transfer.
    pub fn poll_chunks(&mut self, now: Instant) -> Result<Vec<FileChunk>> {
        if self.state != SenderState::Sending {
            return Ok(Vec::new());
        }

        let mut due = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.acked || slot.sends == 0 {
                continue;
            }
            if slot.deadline.is_some_and(|deadline| deadline <= now) {
                if slot.sends > self.policy.max_retries {
                    self.state = SenderState::Failed;
                    warn!(
                        "Chunk {} of {} to {} unacknowledged after {} sends",
                        index, self.file_hash, self.peer, slot.sends
                    );
                    return Err(TransferError::RetriesExhausted {
                        file_hash: self.file_hash.clone(),
                        chunk_index: index as u32,
                        attempts: slot.sends,
                    });
                }
                due.push(index as u32);
            }
        }
        if !due.is_empty() {
            debug!(
                "Retransmitting {} chunks of {} to {}",
                due.len(),
                self.file_hash,
                self.peer
            );
        }

        let mut room = self.policy.max_in_flight.saturating_sub(self.in_flight());
        for (index, slot) in self.slots.iter().enumerate() {
            if room == 0 {
                break;
            }
            if slot.sends == 0 {
                due.push(index as u32);
                room -= 1;
            }
        }

        let mut chunks = Vec::with_capacity(due.len());
        for index in due {
            let slot = &mut self.slots[index as usize];
            slot.sends += 1;
            slot.deadline = Some(now + self.policy.backoff_delay(slot.sends));
            chunks.push(self.chunk(index));
        }
        Ok(chunks)
    }

    /// Record an ack; returns whether it acknowledged a new chunk
    pub fn on_ack(&mut self, ack: &FileChunkAck) -> bool {
        let Some(slot) = self.slots.get_mut(ack.chunk_index as usize) else {
            debug!("Ack for unknown chunk {} of {}", ack.chunk_index, self.file_hash);
            return false;
        };
        self.last_activity = Instant::now();
        if slot.acked {
            return false;
        }
        slot.acked = true;
        slot.deadline = None;
        if self.slots.iter().all(|slot| slot.acked) {
            self.state = SenderState::Acknowledged;
        }
        true
    }

    pub fn is_fully_acked(&self) -> bool {
        self.slots.iter().all(|slot| slot.acked)
    }

    /// Completion notice, once every chunk is acknowledged
    pub fn complete_message(&mut self) -> Option<FileComplete> {
        if self.state == SenderState::Sending && self.is_fully_acked() {
            self.state = SenderState::Acknowledged;
        }
        (self.state == SenderState::Acknowledged).then(|| FileComplete {
            file_hash: self.file_hash.clone(),
        })
    }

    /// Earliest pending retransmission
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|slot| !slot.acked)
            .filter_map(|slot| slot.deadline)
            .min()
    }

    pub fn cancel(&mut self) {
        if matches!(self.state, SenderState::Pending | SenderState::Sending) {
            self.state = SenderState::Cancelled;
        }
    }
}
