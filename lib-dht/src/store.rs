//! Local key-value store
//!
//! Holds the slice of the keyspace this node replicates: JSON values with a
//! publisher and a wall-clock timestamp. Entries expire after the configured
//! TTL and owned entries are re-announced on the republish schedule. The
//! store can snapshot to disk in a versioned container written atomically.

use lib_crypto::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Persistence format version.
const STORE_SNAPSHOT_VERSION: u32 = 1;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A stored value with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: Value,
    pub timestamp: u64,
    pub publisher: NodeId,
}

/// Versioned on-disk container. Values are carried as JSON text because the
/// snapshot encoding is not self-describing.
#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    version: u32,
    entries: Vec<(String, String, u64, NodeId)>,
}

#[derive(Debug)]
pub struct LocalStore {
    entries: HashMap<String, StoredValue>,
    /// Key to next-republish deadline, wall-clock ms.
    republish_queue: HashMap<String, u64>,
    expire_interval: Duration,
    republish_interval: Duration,
}

impl LocalStore {
    pub fn new(expire_interval: Duration, republish_interval: Duration) -> Self {
        LocalStore {
            entries: HashMap::new(),
            republish_queue: HashMap::new(),
            expire_interval,
            republish_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a value and schedule it for republish.
    pub fn put(&mut self, key: &str, value: Value, publisher: NodeId) {
        let now = now_ms();
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                timestamp: now,
                publisher,
            },
        );
        self.republish_queue
            .insert(key.to_string(), now + self.republish_interval.as_millis() as u64);
    }

    /// Store a value, refusing timestamp regressions on consumed-nonce
    /// markers: an existing `consumedAt` is never replaced by a smaller
    /// one. Returns whether the write was accepted.
    pub fn put_checked(&mut self, key: &str, value: Value, publisher: NodeId) -> bool {
        let old_consumed = self
            .entries
            .get(key)
            .and_then(|entry| entry.value.get("consumedAt"))
            .and_then(Value::as_u64);
        let new_consumed = value.get("consumedAt").and_then(Value::as_u64);
        if let (Some(old), Some(new)) = (old_consumed, new_consumed) {
            if new < old {
                debug!(%key, "rejected consumed-marker regression");
                return false;
            }
        }
        self.put(key, value, publisher);
        true
    }

    /// Read a value, treating expired entries as absent.
    pub fn get(&self, key: &str) -> Option<&StoredValue> {
        let entry = self.entries.get(key)?;
        if self.is_expired(entry, now_ms()) {
            return None;
        }
        Some(entry)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<StoredValue> {
        self.republish_queue.remove(key);
        self.entries.remove(key)
    }

    /// Compare-and-swap on the `version` field inside the stored JSON value.
    ///
    /// The write succeeds only when the current record's version equals
    /// `expected_version` (both absent counts as a match). On conflict the
    /// current record is returned and nothing is mutated. Callers serialize
    /// access through the store lock, which makes this atomic per key.
    pub fn cas(
        &mut self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
        publisher: NodeId,
    ) -> Result<(), Value> {
        let current_version = self
            .get(key)
            .and_then(|entry| entry.value.get("version"))
            .and_then(Value::as_u64);

        if current_version != expected_version {
            // Stale expectation; hand back the winner (Null for a vacant key).
            return Err(self
                .get(key)
                .map(|entry| entry.value.clone())
                .unwrap_or(Value::Null));
        }
        self.put(key, value, publisher);
        Ok(())
    }

    fn is_expired(&self, entry: &StoredValue, now: u64) -> bool {
        now.saturating_sub(entry.timestamp) > self.expire_interval.as_millis() as u64
    }

    /// Entries past their republish deadline. Each returned entry is
    /// rescheduled one full interval out.
    pub fn due_for_republish(&mut self) -> Vec<(String, Value)> {
        let now = now_ms();
        let due: Vec<String> = self
            .republish_queue
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for key in due {
            match self.entries.get(&key) {
                Some(entry) if !self.is_expired(entry, now) => {
                    out.push((key.clone(), entry.value.clone()));
                    self.republish_queue
                        .insert(key, now + self.republish_interval.as_millis() as u64);
                }
                _ => {
                    self.republish_queue.remove(&key);
                }
            }
        }
        out
    }

    /// Delete entries past the TTL, along with their queue slots.
    pub fn purge_expired(&mut self) -> Vec<String> {
        let now = now_ms();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
            self.republish_queue.remove(key);
            debug!(%key, "expired value purged");
        }
        expired
    }

    /// Write a snapshot atomically: temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let mut entries: Vec<(String, String, u64, NodeId)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.value.to_string(), v.timestamp, v.publisher))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let snapshot = StoreSnapshot {
            version: STORE_SNAPSHOT_VERSION,
            entries,
        };
        let bytes = bincode::serialize(&snapshot)?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        info!(?path, entries = self.entries.len(), "store snapshot written");
        Ok(())
    }

    /// Load a snapshot, recomputing republish deadlines. Missing files are
    /// a fresh start, not an error.
    pub fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        let tmp = path.with_extension("tmp");
        if tmp.exists() {
            if let Err(err) = std::fs::remove_file(&tmp) {
                warn!(?tmp, %err, "failed to clean up interrupted snapshot");
            }
        }
        if !path.exists() {
            info!(?path, "no store snapshot, starting fresh");
            return Ok(());
        }

        let bytes = std::fs::read(path)?;
        let snapshot: StoreSnapshot = bincode::deserialize(&bytes)?;
        if snapshot.version != STORE_SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported store snapshot version {} (expected {})",
                snapshot.version,
                STORE_SNAPSHOT_VERSION
            );
        }

        let now = now_ms();
        for (key, value_json, timestamp, publisher) in snapshot.entries {
            let value: Value = match serde_json::from_str(&value_json) {
                Ok(v) => v,
                Err(err) => {
                    warn!(%key, %err, "skipping undecodable snapshot entry");
                    continue;
                }
            };
            self.republish_queue
                .insert(key.clone(), now + self.republish_interval.as_millis() as u64);
            self.entries.insert(
                key,
                StoredValue {
                    value,
                    timestamp,
                    publisher,
                },
            );
        }
        info!(?path, entries = self.entries.len(), "store snapshot loaded");
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
