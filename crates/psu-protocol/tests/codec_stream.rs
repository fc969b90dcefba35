//! Framing over an in-memory duplex stream

use std::time::Duration;

use psu_crypto::NodeIdentity;
use psu_protocol::payload::{FileChunk, FileChunkAck, Ping};
use psu_protocol::{
    read_frame, verify_message, write_frame, Message, Payload, ProtocolError, MAX_MESSAGE_SIZE,
};
use tokio::io::{duplex, AsyncWriteExt};

fn chunk_message(index: u32, len: usize) -> Message {
    Message::new(Payload::FileChunk(FileChunk {
        file_hash: "ab".repeat(32),
        chunk_index: index,
        data: vec![index as u8; len],
    }))
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let (mut client, mut server) = duplex(1024);

    let sent: Vec<Message> = (0..5).map(|i| chunk_message(i, 3000)).collect();
    let to_send = sent.clone();
    let writer = tokio::spawn(async move {
        for message in &to_send {
            write_frame(&mut client, message).await.unwrap();
        }
    });

    for expected in &sent {
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(&received, expected);
    }
    writer.await.unwrap();
}

#[tokio::test]
async fn test_signed_message_verifies_after_transport() {
    psu_crypto::init().unwrap();
    let identity = NodeIdentity::generate().unwrap();
    let (mut client, mut server) = duplex(64);

    let message = Message::new(Payload::FileChunkAck(FileChunkAck {
        file_hash: "cd".repeat(32),
        chunk_index: 7,
    }))
    .signed(&identity)
    .unwrap();

    let to_send = message.clone();
    tokio::spawn(async move { write_frame(&mut client, &to_send).await.unwrap() });

    let received = read_frame(&mut server).await.unwrap();
    assert_eq!(received, message);
    assert!(verify_message(&received));
}

#[tokio::test]
async fn test_byte_at_a_time_delivery() {
    let (mut client, mut server) = duplex(1);
    let message = Message::new(Payload::Ping(Ping));
    let frame = psu_protocol::encode_frame(&message).unwrap();

    tokio::spawn(async move {
        for byte in frame {
            client.write_all(&[byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
    });

    let received = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut server))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, message);
}

#[tokio::test]
async fn test_oversized_prefix_rejected_before_body() {
    let (mut client, mut server) = duplex(64);
    let length = (MAX_MESSAGE_SIZE as i32) + 1;
    client.write_all(&length.to_le_bytes()).await.unwrap();

    assert!(matches!(
        read_frame(&mut server).await,
        Err(ProtocolError::OversizedMessage { .. })
    ));
}

#[tokio::test]
async fn test_negative_prefix_rejected() {
    let (mut client, mut server) = duplex(64);
    client.write_all(&(-1i32).to_le_bytes()).await.unwrap();

    let err = read_frame(&mut server).await.unwrap_err();
    assert!(matches!(err, ProtocolError::OversizedMessage { length: -1, .. }));
    assert!(err.is_fatal_to_connection());
}

#[tokio::test]
async fn test_peer_close_is_connection_closed() {
    let (client, mut server) = duplex(64);
    drop(client);

    assert!(matches!(
        read_frame(&mut server).await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_malformed_body_is_not_fatal() {
    let (mut client, mut server) = duplex(256);

    // Valid header for a FileChunk, garbage body
    let original = chunk_message(1, 4);
    let mut bad = psu_protocol::serialize_message(&original).unwrap();
    bad.truncate(27 + 3);
    client.write_all(&(bad.len() as i32).to_le_bytes()).await.unwrap();
    client.write_all(&bad).await.unwrap();

    let good = chunk_message(2, 4);
    write_frame(&mut client, &good).await.unwrap();

    let err = read_frame(&mut server).await.unwrap_err();
    match &err {
        ProtocolError::MalformedPayload { message_id, .. } => {
            assert_eq!(*message_id, Some(original.message_id));
        }
        other => panic!("expected MalformedPayload, got {:?}", other),
    }
    assert!(!err.is_fatal_to_connection());

    assert_eq!(read_frame(&mut server).await.unwrap(), good);
}
