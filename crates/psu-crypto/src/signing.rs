//! Detached Ed25519 signatures over raw bytes
//!
//! Which bytes of a message get signed is decided by the protocol crate.

use sodiumoxide::crypto::sign::ed25519;
use std::fmt;

use crate::error::{CryptoError, Result};
use crate::identity::{NodeIdentity, PUBLIC_KEY_SIZE};

pub const SIGNATURE_SIZE: usize = 64;

/// Detached Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

/// Sign `bytes` with the identity's secret key
pub fn sign_bytes(identity: &NodeIdentity, bytes: &[u8]) -> Signature {
    let signature = ed25519::sign_detached(bytes, &identity.secret_key);
    let mut out = [0u8; SIGNATURE_SIZE];
    out.copy_from_slice(signature.as_ref());
    Signature(out)
}

/// Check `signature` over `bytes` against a raw public key
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_SIZE],
    bytes: &[u8],
    signature: &Signature,
) -> Result<()> {
    let public_key = ed25519::PublicKey::from_slice(public_key).ok_or(CryptoError::MalformedKey)?;
    let signature =
        ed25519::Signature::from_bytes(&signature.0).map_err(|_| CryptoError::SignatureMismatch)?;

    if ed25519::verify_detached(&signature, bytes, &public_key) {
        Ok(())
    } else {
        Err(CryptoError::SignatureMismatch)
    }
}
