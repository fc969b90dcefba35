//! Message-level signing
//!
//! The signature covers [`signing_bytes`]: the canonical serialization with
//! the signature field absent and the sender public key present.

use psu_crypto::{sign_bytes, verify_signature, NodeIdentity};
use tracing::debug;

use crate::codec::signing_bytes;
use crate::error::Result;
use crate::message::Message;

/// Sign a message in place
///
/// Sets the sender public key, clears any previous signature, then signs the
/// canonical bytes.
pub fn sign_message(message: &mut Message, identity: &NodeIdentity) -> Result<()> {
    message.sender_public_key = Some(identity.public_key_bytes());
    message.signature = None;
    let bytes = signing_bytes(message)?;
    message.signature = Some(sign_bytes(identity, &bytes));
    Ok(())
}

/// Verify a message's signature against its embedded public key
///
/// Fails closed: a missing key or signature, a serialization failure or a
/// bad signature all return `false`.
pub fn verify_message(message: &Message) -> bool {
    let (Some(public_key), Some(signature)) = (&message.sender_public_key, &message.signature)
    else {
        return false;
    };

    let bytes = match signing_bytes(message) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Cannot serialize message {} for verification: {}", message.message_id, e);
            return false;
        }
    };

    verify_signature(public_key, &bytes, signature).is_ok()
}
