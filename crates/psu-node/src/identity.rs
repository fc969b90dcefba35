//! Persistent node identity
//!
//! The key file holds the 32-byte Ed25519 seed as hex. A missing file is
//! created with a fresh random seed.

use crate::error::{NodeError, Result};
use psu_crypto::NodeIdentity;
use rand::RngCore;
use std::path::Path;
use tracing::info;

/// Load the identity stored at `path`, generating it on first use
pub fn load_or_generate(path: &Path) -> Result<NodeIdentity> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)?;
        let seed = parse_seed(contents.trim())?;
        let identity = NodeIdentity::from_seed(&seed)?;
        info!("Loaded identity {} from {}", identity.node_id, path.display());
        return Ok(identity);
    }

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let identity = NodeIdentity::from_seed(&seed)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(seed))?;
    info!("Generated identity {} and saved it to {}", identity.node_id, path.display());
    Ok(identity)
}

fn parse_seed(contents: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(contents).map_err(|e| NodeError::KeyFile(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| NodeError::KeyFile(format!("expected 32 bytes, got {}", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identity_is_reloaded() {
        psu_crypto::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[test]
    fn test_malformed_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        std::fs::write(&path, "not hex").unwrap();
        assert!(matches!(load_or_generate(&path), Err(NodeError::KeyFile(_))));

        std::fs::write(&path, "abcd").unwrap();
        assert!(matches!(load_or_generate(&path), Err(NodeError::KeyFile(_))));
    }
}
