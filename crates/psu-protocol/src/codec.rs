//! Canonical message serialization and length-prefixed framing
//!
//! Canonical layout (all integers little-endian):
//!
//! ```text
//! version u8 | type u8 | message_id 16B | timestamp i64 | flags u8
//! | [sender_public_key 32B] | [signature 64B] | [correlation_id 16B]
//! | payload body
//! ```
//!
//! Each optional field is present iff its flag bit is set. A frame is the
//! canonical bytes preceded by a 4-byte little-endian signed length.

use psu_crypto::{Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::message::{Message, MessageType};
use crate::payload::Payload;

/// Maximum size of a single serialized message (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

const FLAG_SENDER_KEY: u8 = 0b0000_0001;
const FLAG_SIGNATURE: u8 = 0b0000_0010;
const FLAG_CORRELATION: u8 = 0b0000_0100;
const KNOWN_FLAGS: u8 = FLAG_SENDER_KEY | FLAG_SIGNATURE | FLAG_CORRELATION;

/// Fixed header: version, type, id, timestamp, flags
const HEADER_SIZE: usize = 1 + 1 + 16 + 8 + 1;

fn serialize_with(message: &Message, include_signature: bool) -> Result<Vec<u8>> {
    let body = message.payload.encode()?;

    let signature = if include_signature {
        message.signature.as_ref()
    } else {
        None
    };

    let mut flags = 0u8;
    if message.sender_public_key.is_some() {
        flags |= FLAG_SENDER_KEY;
    }
    if signature.is_some() {
        flags |= FLAG_SIGNATURE;
    }
    if message.correlation_id.is_some() {
        flags |= FLAG_CORRELATION;
    }

    let mut out = Vec::with_capacity(
        HEADER_SIZE + PUBLIC_KEY_SIZE + SIGNATURE_SIZE + 16 + body.len(),
    );
    out.push(message.version);
    out.push(message.message_type().as_u8());
    out.extend_from_slice(message.message_id.as_bytes());
    out.extend_from_slice(&message.timestamp_millis.to_le_bytes());
    out.push(flags);
    if let Some(key) = &message.sender_public_key {
        out.extend_from_slice(key);
    }
    if let Some(signature) = signature {
        out.extend_from_slice(signature.as_bytes());
    }
    if let Some(correlation_id) = &message.correlation_id {
        out.extend_from_slice(correlation_id.as_bytes());
    }
    out.extend_from_slice(&body);

    if out.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::OversizedMessage {
            length: out.len() as i64,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(out)
}

/// Canonical bytes of a message, signature included when present
pub fn serialize_message(message: &Message) -> Result<Vec<u8>> {
    serialize_with(message, true)
}

/// Canonical bytes with the signature omitted; this is what gets signed
pub fn signing_bytes(message: &Message) -> Result<Vec<u8>> {
    serialize_with(message, false)
}

/// Cursor over an input buffer that fails on truncation
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(ProtocolError::InvalidHeader(format!(
                "truncated {} at offset {}",
                what, self.pos
            ))),
        }
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Decode canonical bytes into a message
pub fn deserialize_message(bytes: &[u8]) -> Result<Message> {
    let mut reader = Reader::new(bytes);

    let [version] = reader.take_array::<1>("version")?;
    let [type_byte] = reader.take_array::<1>("message type")?;
    let message_type = MessageType::try_from(type_byte)?;
    let message_id = Uuid::from_bytes(reader.take_array::<16>("message id")?);
    let timestamp_millis = i64::from_le_bytes(reader.take_array::<8>("timestamp")?);
    let [flags] = reader.take_array::<1>("flags")?;

    if flags & !KNOWN_FLAGS != 0 {
        return Err(ProtocolError::InvalidHeader(format!(
            "unknown flag bits 0x{:02x}",
            flags & !KNOWN_FLAGS
        )));
    }

    let sender_public_key = if flags & FLAG_SENDER_KEY != 0 {
        Some(reader.take_array::<PUBLIC_KEY_SIZE>("sender public key")?)
    } else {
        None
    };
    let signature = if flags & FLAG_SIGNATURE != 0 {
        Some(Signature::from_bytes(
            reader.take_array::<SIGNATURE_SIZE>("signature")?,
        ))
    } else {
        None
    };
    let correlation_id = if flags & FLAG_CORRELATION != 0 {
        Some(Uuid::from_bytes(reader.take_array::<16>("correlation id")?))
    } else {
        None
    };

    let payload = Payload::decode(message_type, reader.rest()).map_err(|e| match e {
        ProtocolError::MalformedPayload {
            message_type,
            reason,
            ..
        } => ProtocolError::MalformedPayload {
            message_type,
            reason,
            message_id: Some(message_id),
        },
        other => other,
    })?;

    Ok(Message {
        version,
        message_id,
        timestamp_millis,
        sender_public_key,
        signature,
        correlation_id,
        payload,
    })
}

/// Validate a frame length prefix, returning the body length
pub fn check_length_prefix(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    let length = i32::from_le_bytes(prefix);
    if length <= 0 || length as usize > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::OversizedMessage {
            length: length as i64,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(length as usize)
}

/// Encode a message as one frame: length prefix plus canonical bytes
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = serialize_message(message)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, and the
/// number of bytes consumed otherwise.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
    let length = check_length_prefix(prefix)?;

    let end = LENGTH_PREFIX_SIZE + length;
    if buf.len() < end {
        return Ok(None);
    }
    let message = deserialize_message(&buf[LENGTH_PREFIX_SIZE..end])?;
    Ok(Some((message, end)))
}

/// Fill `buf` completely, retrying partial reads
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return Err(ProtocolError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read exactly one frame from a stream
///
/// The length is validated before any body bytes are read, so an oversized
/// prefix never causes an allocation.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    read_full(reader, &mut prefix).await?;
    let length = check_length_prefix(prefix)?;

    let mut body = vec![0u8; length];
    read_full(reader, &mut body).await?;
    trace!("Read frame of {} bytes", length);

    deserialize_message(&body)
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(
        "Wrote {:?} frame of {} bytes",
        message.message_type(),
        frame.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;
    use crate::payload::*;
    use psu_crypto::NodeId;

    fn sample_message() -> Message {
        let mut message = Message::new(Payload::DhtStore(DhtStore {
            sender: PeerInfo {
                node_id: NodeId::from_bytes([1; 20]),
                public_key: [2; 32],
                address: "127.0.0.1:7000".parse().unwrap(),
                services: Default::default(),
                last_seen: 42,
                reputation: 0.5,
            },
            key: "peer:alice".to_string(),
            value: b"blob".to_vec(),
            ttl_secs: 3600,
            replication_factor: 3,
        }));
        message.correlation_id = Some(Uuid::new_v4());
        message
    }

    #[test]
    fn test_round_trip() {
        let message = sample_message();
        let bytes = serialize_message(&message).unwrap();
        assert_eq!(deserialize_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_round_trip_with_key_and_signature() {
        let mut message = Message::new(Payload::Error(ErrorPayload {
            code: ErrorCode::PeerUnreachable,
            message: "target never probed".to_string(),
        }));
        message.sender_public_key = Some([7; 32]);
        message.signature = Some(Signature::from_bytes([9; 64]));

        let bytes = serialize_message(&message).unwrap();
        assert_eq!(bytes[26], FLAG_SENDER_KEY | FLAG_SIGNATURE);
        assert_eq!(deserialize_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_header_layout() {
        let mut message = Message::new(Payload::Ping(Ping));
        message.timestamp_millis = 0x0102_0304_0506_0708;
        let bytes = serialize_message(&message).unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 254);
        assert_eq!(&bytes[2..18], message.message_id.as_bytes());
        assert_eq!(&bytes[18..26], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(bytes[26], 0);
    }

    #[test]
    fn test_signing_bytes_omit_signature() {
        let mut message = sample_message();
        let unsigned = signing_bytes(&message).unwrap();
        message.signature = Some(Signature::from_bytes([3; 64]));

        assert_eq!(signing_bytes(&message).unwrap(), unsigned);
        assert_eq!(
            serialize_message(&message).unwrap().len(),
            unsigned.len() + SIGNATURE_SIZE
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = serialize_message(&sample_message()).unwrap();
        bytes[1] = 200;
        assert!(matches!(
            deserialize_message(&bytes),
            Err(ProtocolError::UnknownMessageType(200))
        ));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut bytes = serialize_message(&Message::new(Payload::Pong(Pong))).unwrap();
        bytes[26] |= 0b1000_0000;
        assert!(matches!(
            deserialize_message(&bytes),
            Err(ProtocolError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let bytes = serialize_message(&sample_message()).unwrap();
        assert!(deserialize_message(&bytes[..10]).is_err());
        assert!(deserialize_message(&[]).is_err());
    }

    #[test]
    fn test_length_prefix_bounds() {
        assert!(check_length_prefix(0i32.to_le_bytes()).is_err());
        assert!(check_length_prefix((-5i32).to_le_bytes()).is_err());
        assert!(check_length_prefix(((MAX_MESSAGE_SIZE + 1) as i32).to_le_bytes()).is_err());
        assert_eq!(
            check_length_prefix((MAX_MESSAGE_SIZE as i32).to_le_bytes()).unwrap(),
            MAX_MESSAGE_SIZE
        );
        assert_eq!(check_length_prefix(1i32.to_le_bytes()).unwrap(), 1);
    }

    #[test]
    fn test_decode_frame_incremental() {
        let message = sample_message();
        let frame = encode_frame(&message).unwrap();

        assert!(decode_frame(&frame[..3]).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());

        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        let (decoded, consumed) = decode_frame(&two).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(consumed, frame.len());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_zero_length() {
        let mut input: &[u8] = &[0, 0, 0, 0];
        assert!(matches!(
            read_frame(&mut input).await,
            Err(ProtocolError::OversizedMessage { length: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_eof_mid_body() {
        let frame = encode_frame(&sample_message()).unwrap();
        let mut input: &[u8] = &frame[..frame.len() - 5];
        assert!(matches!(
            read_frame(&mut input).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
