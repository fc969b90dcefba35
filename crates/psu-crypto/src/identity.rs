//! Node identities and the 160-bit id space
//!
//! A node id is the BLAKE2b-512 digest of the node's Ed25519 public key,
//! truncated to 20 bytes. DHT keys are hashed into the same space, so XOR
//! distance is defined between any id and any key.

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::sign::ed25519;
use std::fmt;

use crate::error::{CryptoError, Result};

pub const NODE_ID_SIZE: usize = 20;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SEED_SIZE: usize = 32;

/// 160-bit node identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 40-character hex form used in configuration files
    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let bytes: [u8; NODE_ID_SIZE] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::WrongLength {
                    expected: NODE_ID_SIZE,
                    actual: decoded.len(),
                })?;
        Ok(NodeId(bytes))
    }

    /// XOR distance to `other`
    ///
    /// Arrays compare lexicographically, which orders distances as unsigned
    /// big-endian integers.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_SIZE] {
        std::array::from_fn(|i| self.0[i] ^ other.0[i])
    }

    /// Leading zero bits of the distance to `other`; 160 for equal ids
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let distance = self.distance(other);
        distance
            .iter()
            .position(|byte| *byte != 0)
            .map(|index| index * 8 + distance[index].leading_zeros() as usize)
            .unwrap_or(NODE_ID_SIZE * 8)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// Shortened to the first 8 bytes for log lines
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Key pair of the local node
#[derive(Clone)]
pub struct NodeIdentity {
    pub public_key: ed25519::PublicKey,
    pub secret_key: ed25519::SecretKey,
    pub node_id: NodeId,
}

impl NodeIdentity {
    /// Fresh random identity
    pub fn generate() -> Result<Self> {
        let (public_key, secret_key) = ed25519::gen_keypair();
        Ok(Self::from_keypair(public_key, secret_key))
    }

    /// Identity derived from a 32-byte seed, as stored in key files
    pub fn from_seed(seed: &[u8; SEED_SIZE]) -> Result<Self> {
        let seed = ed25519::Seed::from_slice(seed).ok_or(CryptoError::MalformedKey)?;
        let (public_key, secret_key) = ed25519::keypair_from_seed(&seed);
        Ok(Self::from_keypair(public_key, secret_key))
    }

    /// Rebuild an identity from raw public and secret key bytes
    pub fn from_bytes(public_key: &[u8], secret_key: &[u8]) -> Result<Self> {
        let public_key = ed25519::PublicKey::from_slice(public_key).ok_or(CryptoError::MalformedKey)?;
        let secret_key = ed25519::SecretKey::from_slice(secret_key).ok_or(CryptoError::MalformedKey)?;
        if secret_key.public_key() != public_key {
            return Err(CryptoError::MalformedKey);
        }
        Ok(Self::from_keypair(public_key, secret_key))
    }

    fn from_keypair(public_key: ed25519::PublicKey, secret_key: ed25519::SecretKey) -> Self {
        let node_id = Self::derive_node_id(public_key.as_ref());
        Self {
            public_key,
            secret_key,
            node_id,
        }
    }

    /// Node id owned by the holder of `public_key`
    pub fn derive_node_id(public_key: &[u8]) -> NodeId {
        let digest = Blake2b512::digest(public_key);
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&digest[..NODE_ID_SIZE]);
        NodeId(id)
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.0
    }

    /// Seed the identity can be restored from with [`NodeIdentity::from_seed`]
    pub fn seed(&self) -> [u8; SEED_SIZE] {
        // libsodium keeps the secret key as seed || public key
        let mut seed = [0u8; SEED_SIZE];
        seed.copy_from_slice(&self.secret_key.0[..SEED_SIZE]);
        seed
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
