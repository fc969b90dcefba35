//! Request/response correlation
//!
//! Outbound requests are registered by message id before they are written.
//! A response whose `correlation_id` matches a pending entry completes it;
//! responses for unknown, timed-out or cancelled ids are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::message::{Message, MessageType};

/// Default cap on concurrently pending requests
pub const DEFAULT_MAX_PENDING: usize = 1024;

struct PendingEntry {
    sender: oneshot::Sender<Message>,
    request_type: MessageType,
    registered_at: Instant,
}

/// Table of requests awaiting a response
#[derive(Clone)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<Uuid, PendingEntry>>>,
    max_pending: usize,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl PendingRequests {
    pub fn new(max_pending: usize) -> Self {
        PendingRequests {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_pending,
        }
    }

    /// Register an outbound request, returning a handle to await its response
    pub async fn register(&self, request: &Message) -> Result<ResponseHandle> {
        let (sender, receiver) = oneshot::channel();
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_pending {
            return Err(ProtocolError::TooManyPendingRequests(self.max_pending));
        }
        entries.insert(
            request.message_id,
            PendingEntry {
                sender,
                request_type: request.message_type(),
                registered_at: Instant::now(),
            },
        );
        trace!("Registered pending {:?} {}", request.message_type(), request.message_id);

        Ok(ResponseHandle {
            request_id: request.message_id,
            receiver,
            pending: self.clone(),
        })
    }

    /// Deliver a response to its waiter
    ///
    /// Returns the message back if it does not answer a pending request, so
    /// the caller can treat it as unsolicited.
    pub async fn complete(&self, response: Message) -> std::result::Result<(), Message> {
        let Some(correlation_id) = response.correlation_id else {
            return Err(response);
        };

        let entry = self.entries.lock().await.remove(&correlation_id);
        match entry {
            Some(entry) => {
                trace!(
                    "Completing {:?} {} after {:?}",
                    entry.request_type,
                    correlation_id,
                    entry.registered_at.elapsed()
                );
                // The waiter may have given up between removal and send
                let _ = entry.sender.send(response);
                Ok(())
            }
            None => {
                debug!("Dropping late or unknown response for {}", correlation_id);
                Err(response)
            }
        }
    }

    /// Cancel a pending request; its late response will be dropped
    pub async fn cancel(&self, request_id: &Uuid) -> bool {
        self.entries.lock().await.remove(request_id).is_some()
    }

    /// Drop every entry older than `max_age`, returning how many were removed
    pub async fn expire_older_than(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.registered_at.elapsed() < max_age);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Handle to a single pending request
pub struct ResponseHandle {
    request_id: Uuid,
    receiver: oneshot::Receiver<Message>,
    pending: PendingRequests,
}

impl ResponseHandle {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait up to `timeout` for the response
    ///
    /// On timeout the entry is removed so a late response is dropped.
    pub async fn wait(self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::RequestCancelled),
            Err(_) => {
                self.pending.cancel(&self.request_id).await;
                Err(ProtocolError::RequestTimeout)
            }
        }
    }
}
