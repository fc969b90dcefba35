//! DHT storage for key-value pairs

use crate::error::{DhtError, Result};
use crate::{MAX_DHT_KEYS, MAX_DHT_STORAGE_BYTES, MAX_TTL_SECS, MAX_VALUE_SIZE};
use psu_protocol::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Get current timestamp
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Clamp a requested TTL into `[1, MAX_TTL_SECS]`
pub fn clamp_ttl(ttl_secs: u32) -> u64 {
    (ttl_secs as u64).clamp(1, MAX_TTL_SECS)
}

/// A stored value with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRecord {
    pub key: String,

    pub value: Vec<u8>,

    /// When this record was stored (Unix timestamp)
    pub stored_at: u64,

    /// When this record expires (Unix timestamp)
    pub expires_at: u64,

    pub replication_factor: u32,

    /// Node that published the record
    pub publisher: NodeId,
}

impl DhtRecord {
    /// Create a record expiring `ttl_secs` from now (clamped to 24 hours)
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        ttl_secs: u32,
        replication_factor: u32,
        publisher: NodeId,
    ) -> Self {
        let stored_at = now();
        DhtRecord {
            key: key.into(),
            value,
            stored_at,
            expires_at: stored_at + clamp_ttl(ttl_secs),
            replication_factor,
            publisher,
        }
    }

    /// Check if record is expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now())
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Get remaining TTL in seconds
    pub fn ttl_remaining(&self) -> u64 {
        self.expires_at.saturating_sub(now())
    }
}

/// DHT storage layer
#[derive(Debug)]
pub struct DhtStorage {
    /// Stored records by key
    entries: HashMap<String, DhtRecord>,

    /// Current storage size in bytes
    current_size: usize,

    /// Maximum storage size
    max_size: usize,

    /// Maximum number of keys
    max_keys: usize,
}

impl Default for DhtStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DhtStorage {
    /// Create new DHT storage
    pub fn new() -> Self {
        Self::with_limits(MAX_DHT_STORAGE_BYTES, MAX_DHT_KEYS)
    }

    /// Create with custom limits
    pub fn with_limits(max_size: usize, max_keys: usize) -> Self {
        DhtStorage {
            entries: HashMap::new(),
            current_size: 0,
            max_size,
            max_keys,
        }
    }

    /// Get current storage size in bytes
    pub fn size(&self) -> usize {
        self.current_size
    }

    /// Get number of stored keys
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Fraction of capacity in use, by bytes or keys, whichever is higher
    pub fn load_factor(&self) -> f32 {
        let by_size = self.current_size as f32 / self.max_size.max(1) as f32;
        let by_keys = self.entries.len() as f32 / self.max_keys.max(1) as f32;
        by_size.max(by_keys).min(1.0)
    }

    /// Check if storage has capacity for `record`, counting the record it
    /// would replace as freed
    fn has_room_for(&self, record: &DhtRecord) -> bool {
        let replaced = self.entries.get(&record.key).map(|r| r.value.len());
        let keys_ok = replaced.is_some() || self.key_count() < self.max_keys;
        keys_ok && self.current_size - replaced.unwrap_or(0) + record.value.len() <= self.max_size
    }

    /// Store a record
    ///
    /// Last write wins by `expires_at`: a record that expires earlier than
    /// the one already held is ignored. Returns the expiry of the record
    /// held after the call.
    pub fn store(&mut self, record: DhtRecord) -> Result<u64> {
        if record.key.is_empty() {
            return Err(DhtError::InvalidKey("key must not be empty".to_string()));
        }
        if record.value.len() > MAX_VALUE_SIZE {
            return Err(DhtError::ValueTooLarge {
                size: record.value.len(),
                max: MAX_VALUE_SIZE,
            });
        }

        match self.entries.get(&record.key) {
            Some(existing) if !existing.is_expired() && existing.expires_at > record.expires_at => {
                debug!(
                    "Ignoring store for {}: held record expires later",
                    record.key
                );
                return Ok(existing.expires_at);
            }
            _ => {}
        }

        if !self.has_room_for(&record) {
            // May drop the record being replaced, so room is re-checked after
            self.cleanup_expired();
            if !self.has_room_for(&record) {
                if !self.entries.contains_key(&record.key) && self.key_count() >= self.max_keys {
                    return Err(DhtError::TooManyKeys(self.max_keys));
                }
                return Err(DhtError::StorageFull { max: self.max_size });
            }
        }

        if let Some(replaced) = self.entries.remove(&record.key) {
            self.current_size -= replaced.value.len();
        }

        let expires_at = record.expires_at;
        self.current_size += record.value.len();
        self.entries.insert(record.key.clone(), record);
        Ok(expires_at)
    }

    /// Retrieve a live record
    pub fn get(&self, key: &str) -> Option<&DhtRecord> {
        self.get_at(key, now())
    }

    /// Retrieve a record that is live at `now`
    pub fn get_at(&self, key: &str, now: u64) -> Option<&DhtRecord> {
        self.entries
            .get(key)
            .filter(|record| !record.is_expired_at(now))
    }

    /// Remove a record
    pub fn remove(&mut self, key: &str) -> Option<DhtRecord> {
        let record = self.entries.remove(key)?;
        self.current_size -= record.value.len();
        Some(record)
    }

    /// Cleanup expired records
    pub fn cleanup_expired(&mut self) -> usize {
        self.cleanup_expired_at(now())
    }

    pub fn cleanup_expired_at(&mut self, now: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, record)| record.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }

        if !expired.is_empty() {
            debug!("Removed {} expired DHT records", expired.len());
        }
        expired.len()
    }

    /// Keys of all live records
    pub fn keys(&self) -> Vec<String> {
        let now = now();
        self.entries
            .values()
            .filter(|record| !record.is_expired_at(now))
            .map(|record| record.key.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }
}
