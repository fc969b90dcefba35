//! Hashing helpers
//!
//! - DHT keys are mapped into the node ID space with BLAKE2b (same
//!   truncation as node ID derivation).
//! - File content is addressed by its lowercase hex SHA-256 digest.

use blake2::Blake2b512;
use sha2::{Digest, Sha256};

use crate::identity::{NodeId, NODE_ID_SIZE};

/// Map an arbitrary DHT key (e.g. `"peer:alice"`) into the node ID space
pub fn key_to_node_id(key: &str) -> NodeId {
    let mut hasher = Blake2b512::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; NODE_ID_SIZE];
    bytes.copy_from_slice(&hash[..NODE_ID_SIZE]);
    NodeId::from_bytes(bytes)
}

/// SHA-256 content hash as lowercase hex
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental SHA-256 over chunks, for content assembled piecewise
pub fn content_hash_chunks<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_to_node_id_is_stable() {
        assert_eq!(key_to_node_id("peer:alice"), key_to_node_id("peer:alice"));
        assert_ne!(key_to_node_id("peer:alice"), key_to_node_id("peer:bob"));
    }

    #[test]
    fn test_content_hash_known_vector() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_chunked_hash_matches_whole() {
        let data = b"hello chunked world";
        let chunks: Vec<&[u8]> = data.chunks(4).collect();
        assert_eq!(content_hash_chunks(chunks), content_hash(data));
    }
}
