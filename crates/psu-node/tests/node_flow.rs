//! Nodes talking to each other over loopback TCP

use psu_crypto::NodeIdentity;
use psu_dht::FindValueResult;
use psu_node::{Config, Node};
use psu_protocol::payload::{FileChunk, Ping};
use psu_protocol::{
    read_frame, serialize_message, verify_message, write_frame, ErrorCode, Message, Payload,
};
use psu_transfer::TransferEvent;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn config(relay: bool) -> Config {
    let mut config = Config::default();
    config.node.listen_address = "127.0.0.1:0".parse().unwrap();
    config.node.request_timeout_secs = 2;
    config.dht.query_timeout_secs = 2;
    config.relay.enabled = relay;
    config.relay.punch_lead_millis = 50;
    config.relay.punch_window_millis = 500;
    config.relay.punch_max_attempts = 2;
    config.relay.punch_attempt_timeout_millis = 100;
    config.transfer.chunk_size = 1024;
    config.transfer.ack_timeout_millis = 1000;
    config
}

async fn start(relay: bool) -> Arc<Node> {
    psu_crypto::init().unwrap();
    Node::start(config(relay), NodeIdentity::generate().unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ping_between_nodes() {
    let a = start(false).await;
    let b = start(false).await;

    let rtt = a.ping(b.local_peer()).await.unwrap();
    assert!(rtt < WAIT);
    assert!(a.network().is_connected(b.node_id()).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_unsigned_frames_are_ignored() {
    let node = start(false).await;
    let remote = NodeIdentity::generate().unwrap();
    let stream = TcpStream::connect(node.local_peer().address).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    write_frame(&mut writer, &Message::new(Payload::Ping(Ping)))
        .await
        .unwrap();
    let signed = Message::new(Payload::Ping(Ping)).signed(&remote).unwrap();
    write_frame(&mut writer, &signed).await.unwrap();

    // Only the signed ping is answered
    let reply = timeout(WAIT, read_frame(&mut reader)).await.unwrap().unwrap();
    assert_eq!(reply.payload, Payload::Pong(psu_protocol::payload::Pong));
    assert_eq!(reply.correlation_id, Some(signed.message_id));
    assert!(verify_message(&reply));
    assert_eq!(reply.sender_node_id(), Some(*node.node_id()));

    node.shutdown().await;
}

#[tokio::test]
async fn test_corrupted_body_gets_correlated_error() {
    let node = start(false).await;
    let remote = NodeIdentity::generate().unwrap();
    let stream = TcpStream::connect(node.local_peer().address).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let chunk = Message::new(Payload::FileChunk(FileChunk {
        file_hash: "ab".repeat(32),
        chunk_index: 0,
        data: vec![1; 64],
    }))
    .signed(&remote)
    .unwrap();
    let mut bytes = serialize_message(&chunk).unwrap();
    bytes.truncate(bytes.len() - 40);
    writer.write_all(&(bytes.len() as i32).to_le_bytes()).await.unwrap();
    writer.write_all(&bytes).await.unwrap();

    let reply = timeout(WAIT, read_frame(&mut reader)).await.unwrap().unwrap();
    assert_eq!(reply.correlation_id, Some(chunk.message_id));
    assert!(verify_message(&reply));
    match reply.payload {
        Payload::Error(error) => assert_eq!(error.code, ErrorCode::MalformedPayload),
        other => panic!("expected Error, got {:?}", other),
    }

    // The connection survives
    let ping = Message::new(Payload::Ping(Ping)).signed(&remote).unwrap();
    write_frame(&mut writer, &ping).await.unwrap();
    let pong = timeout(WAIT, read_frame(&mut reader)).await.unwrap().unwrap();
    assert_eq!(pong.correlation_id, Some(ping.message_id));

    node.shutdown().await;
}

#[tokio::test]
async fn test_dht_bootstrap_store_and_find() {
    let a = start(false).await;
    let b = start(false).await;

    let size = b.bootstrap_with(&[a.local_peer().clone()]).await.unwrap();
    assert!(size >= 1);
    assert!(a
        .dht()
        .routing_table()
        .read()
        .await
        .find_node(b.node_id())
        .is_some());

    let report = b.store("greeting", b"hello".to_vec(), 600, 2).await.unwrap();
    assert!(report.replication_count >= 2);

    match a.find_value("greeting").await.unwrap() {
        FindValueResult::Found { value, .. } => assert_eq!(value, b"hello"),
        other => panic!("expected value, got {:?}", other),
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_file_transfer_between_nodes() {
    let provider = start(false).await;
    let fetcher = start(false).await;

    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), "pattern.bin".to_string());
    let file_hash = provider.share_file(content.clone(), metadata).await;

    fetcher
        .request_file(provider.local_peer(), &file_hash)
        .await
        .unwrap();

    let event = timeout(WAIT, fetcher.next_event()).await.unwrap().unwrap();
    match event {
        TransferEvent::Received {
            peer,
            file_hash: received_hash,
            data,
        } => {
            assert_eq!(peer, *provider.node_id());
            assert_eq!(received_hash, file_hash);
            assert_eq!(data, content);
        }
        other => panic!("expected a received file, got {:?}", other),
    }

    let event = timeout(WAIT, provider.next_event()).await.unwrap().unwrap();
    assert!(matches!(event, TransferEvent::Sent { .. }));

    provider.shutdown().await;
    fetcher.shutdown().await;
}

#[tokio::test]
async fn test_unknown_file_reports_failure() {
    let provider = start(false).await;
    let fetcher = start(false).await;

    fetcher
        .request_file(provider.local_peer(), "00".repeat(32).as_str())
        .await
        .unwrap();
    let event = timeout(WAIT, fetcher.next_event()).await.unwrap().unwrap();
    assert!(matches!(event, TransferEvent::Failed { .. }));

    provider.shutdown().await;
    fetcher.shutdown().await;
}

#[tokio::test]
async fn test_relay_join_and_probe() {
    let relay = start(true).await;
    let member = start(false).await;

    member.join_relay(relay.local_peer().clone()).await.unwrap();
    let service = relay.relay_service().unwrap();
    assert!(service
        .registry()
        .read()
        .await
        .get(member.node_id())
        .is_some());

    let observed = member.probe_nat(relay.local_peer()).await.unwrap();
    assert!(observed.ip().is_loopback());

    relay.shutdown().await;
    member.shutdown().await;
}

#[tokio::test]
async fn test_relay_refused_when_disabled() {
    let plain = start(false).await;
    let member = start(false).await;

    assert!(member.join_relay(plain.local_peer().clone()).await.is_err());

    plain.shutdown().await;
    member.shutdown().await;
}

#[tokio::test]
async fn test_punch_coordinated_through_relay() {
    let relay = start(true).await;
    let a = start(false).await;
    let b = start(false).await;

    // The relay needs a fresh observation of the target
    b.probe_nat(relay.local_peer()).await.unwrap();
    a.probe_nat(relay.local_peer()).await.unwrap();

    let outcome = timeout(WAIT, a.punch_via_relay(relay.local_peer(), *b.node_id()))
        .await
        .unwrap();
    assert!(outcome.is_ok());

    relay.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_punch_to_unprobed_target_fails() {
    let relay = start(true).await;
    let a = start(false).await;
    let b = start(false).await;

    let result = a.punch_via_relay(relay.local_peer(), *b.node_id()).await;
    assert!(matches!(
        result,
        Err(psu_node::NodeError::Remote {
            code: psu_protocol::ErrorCode::PeerUnreachable,
            ..
        })
    ));

    relay.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}
