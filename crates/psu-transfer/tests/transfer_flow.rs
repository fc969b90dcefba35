//! Two transfer managers exchanging a file, with and without loss or corruption

use psu_crypto::hashing::content_hash;
use psu_protocol::payload::FileChunk;
use psu_protocol::{NodeId, Payload};
use psu_transfer::{
    RetryPolicy, TransferConfig, TransferError, TransferEvent, TransferManager, TransferState,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

fn id(byte: u8) -> NodeId {
    NodeId::from_bytes([byte; 20])
}

fn manager() -> TransferManager {
    TransferManager::new(TransferConfig {
        chunk_size: 16,
        retry: RetryPolicy {
            ack_timeout: Duration::from_secs(5),
            max_backoff: Duration::from_secs(20),
            max_retries: 3,
            max_in_flight: 4,
        },
        ..TransferConfig::default()
    })
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Deliver messages between provider (id 1) and receiver (id 2) until quiet
///
/// `tamper` may rewrite or drop each message before delivery. Returns the
/// events from both sides and the first error the receiver raised.
async fn pump(
    provider: &TransferManager,
    receiver: &TransferManager,
    initial: Payload,
    mut tamper: impl FnMut(Payload) -> Option<Payload>,
) -> (Vec<TransferEvent>, Option<TransferError>) {
    let (provider_id, receiver_id) = (id(1), id(2));
    // (to_provider, payload)
    let mut queue = VecDeque::from([(true, initial)]);
    let mut events = Vec::new();
    let mut receiver_error = None;

    while let Some((to_provider, payload)) = queue.pop_front() {
        let Some(payload) = tamper(payload) else {
            continue;
        };
        let result = if to_provider {
            provider.handle(receiver_id, &payload).await
        } else {
            receiver.handle(provider_id, &payload).await
        };
        match result {
            Ok(reply) => {
                events.extend(reply.event);
                queue.extend(reply.responses.into_iter().map(|p| (!to_provider, p)));
            }
            Err(e) => {
                if !to_provider && receiver_error.is_none() {
                    receiver_error = Some(e);
                }
            }
        }
    }
    (events, receiver_error)
}

#[tokio::test]
async fn test_file_transferred_and_verified() {
    let provider = manager();
    let receiver = manager();
    let data = content(100);
    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), "character.dat".to_string());
    let hash = provider.share_file(data.clone(), metadata).await;

    let request = receiver.request_file(id(1), &hash).await.unwrap();
    let (events, error) = pump(&provider, &receiver, Payload::FileRequest(request), Some).await;

    assert!(error.is_none());
    assert!(events.contains(&TransferEvent::Received {
        peer: id(1),
        file_hash: hash.clone(),
        data: data.clone(),
    }));
    assert!(events.contains(&TransferEvent::Sent {
        peer: id(2),
        file_hash: hash.clone(),
    }));
    assert_eq!(provider.active_sessions().await, (0, 0));
    assert_eq!(receiver.active_sessions().await, (0, 0));
}

#[tokio::test]
async fn test_one_corrupted_chunk_is_integrity_error() {
    let provider = manager();
    let receiver = manager();
    let data = content(100);
    let hash = provider.share_file(data, BTreeMap::new()).await;

    let request = receiver.request_file(id(1), &hash).await.unwrap();
    let (events, error) = pump(&provider, &receiver, Payload::FileRequest(request), |payload| {
        match payload {
            Payload::FileChunk(mut chunk) if chunk.chunk_index == 2 => {
                chunk.data[0] ^= 0xFF;
                Some(Payload::FileChunk(chunk))
            }
            other => Some(other),
        }
    })
    .await;

    let error = error.expect("receiver rejects the transfer");
    assert!(matches!(error, TransferError::Integrity { ref file_hash, .. } if *file_hash == hash));
    assert!(error.is_fatal());
    assert!(!events
        .iter()
        .any(|event| matches!(event, TransferEvent::Received { .. })));
    // The failed session is gone and cannot complete later
    assert!(receiver.session_state(&id(1), &hash).await.is_none());
}

#[tokio::test]
async fn test_lost_chunk_is_retransmitted() {
    let provider = manager();
    let receiver = manager();
    let data = content(40);
    let hash = provider.share_file(data.clone(), BTreeMap::new()).await;

    let request = receiver.request_file(id(1), &hash).await.unwrap();
    let mut dropped = false;
    let (events, error) = pump(&provider, &receiver, Payload::FileRequest(request), |payload| {
        match payload {
            Payload::FileChunk(FileChunk { chunk_index: 1, .. }) if !dropped => {
                dropped = true;
                None
            }
            other => Some(other),
        }
    })
    .await;
    assert!(error.is_none());
    assert!(events.is_empty());
    assert_eq!(
        receiver.session_state(&id(1), &hash).await,
        Some(TransferState::Transferring)
    );
    assert_eq!(receiver.received_indices(&id(1), &hash).await, Some(vec![0, 2]));

    // The ack deadline passes and chunk 1 goes out again
    let deadline = provider.next_deadline().await.unwrap();
    let resent = provider.poll_retransmissions_at(deadline).await;
    assert_eq!(resent.len(), 1);
    let (to, payload) = resent.into_iter().next().unwrap();
    assert_eq!(to, id(2));

    let reply = receiver.handle(id(1), &payload).await.unwrap();
    let ack = reply.responses.into_iter().next().unwrap();
    let reply = provider.handle(id(2), &ack).await.unwrap();
    let complete = reply.responses.into_iter().next().unwrap();
    assert!(matches!(complete, Payload::FileComplete(_)));

    let reply = receiver.handle(id(1), &complete).await.unwrap();
    assert_eq!(
        reply.event,
        Some(TransferEvent::Received {
            peer: id(1),
            file_hash: content_hash(&data),
            data,
        })
    );
}

#[tokio::test]
async fn test_cancel_mid_transfer() {
    let provider = manager();
    let receiver = manager();
    let hash = provider.share_file(content(100), BTreeMap::new()).await;

    let request = receiver.request_file(id(1), &hash).await.unwrap();
    // Deliver only the request so the provider has an outgoing session
    provider
        .handle(id(2), &Payload::FileRequest(request))
        .await
        .unwrap();
    assert_eq!(provider.active_sessions().await, (0, 1));

    let cancel = receiver.cancel(id(1), &hash, Some("user".to_string())).await.unwrap();
    let reply = provider.handle(id(2), &Payload::FileCancel(cancel)).await.unwrap();
    assert!(matches!(reply.event, Some(TransferEvent::Cancelled { .. })));
    assert_eq!(provider.active_sessions().await, (0, 0));
    let later = Instant::now() + Duration::from_secs(60);
    assert!(provider.poll_retransmissions_at(later).await.is_empty());
}
