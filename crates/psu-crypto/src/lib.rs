//! Identity primitives for the PocketSizedUniverse network
//!
//! Ed25519 key pairs, 160-bit node ids (truncated BLAKE2b of the public
//! key) with XOR distance, detached signatures over raw bytes, and the
//! SHA-256 content addressing used by file transfer.

pub mod error;
pub mod hashing;
pub mod identity;
pub mod signing;

pub use error::{CryptoError, Result};
pub use identity::{NodeId, NodeIdentity, NODE_ID_SIZE, PUBLIC_KEY_SIZE};
pub use signing::{sign_bytes, verify_signature, Signature, SIGNATURE_SIZE};

/// Initialize libsodium; safe to call more than once
pub fn init() -> Result<()> {
    sodiumoxide::init().map_err(|_| CryptoError::InitializationFailed)
}
