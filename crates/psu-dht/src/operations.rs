//! Results of the high-level DHT operations (STORE, FIND_VALUE)

use psu_protocol::{NodeId, PeerInfo};

/// Outcome of a FIND_VALUE lookup
#[derive(Debug, Clone, PartialEq)]
pub enum FindValueResult {
    /// A node holding the value answered
    Found {
        value: Vec<u8>,
        /// Unix seconds at which the holder's record expires
        expiration_time: Option<u64>,
        /// `None` when served from local storage
        holder: Option<NodeId>,
    },

    /// Value not found, here are the closest nodes that responded
    NotFound { closest: Vec<PeerInfo> },
}

impl FindValueResult {
    pub fn is_found(&self) -> bool {
        matches!(self, FindValueResult::Found { .. })
    }

    /// The value, if found
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            FindValueResult::Found { value, .. } => Some(value),
            FindValueResult::NotFound { .. } => None,
        }
    }
}

/// Outcome of a replicated STORE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    /// Number of nodes (local included) that hold the record
    pub replication_count: u32,

    /// Unix seconds at which the stored record expires
    pub expiration_time: u64,

    /// Whether the local node kept a copy
    pub stored_locally: bool,

    /// Remote nodes that acknowledged the store
    pub acknowledged_by: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_value_result_accessors() {
        let found = FindValueResult::Found {
            value: b"v".to_vec(),
            expiration_time: Some(10),
            holder: None,
        };
        assert!(found.is_found());
        assert_eq!(found.value(), Some(&b"v"[..]));

        let not_found = FindValueResult::NotFound { closest: vec![] };
        assert!(!not_found.is_found());
        assert_eq!(not_found.value(), None);
    }
}
