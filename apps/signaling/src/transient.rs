//! Per-room transient key/value data, broadcast to members on change.
//!
//! Values live only as long as the room. Entries may carry a TTL; the hub's
//! timer sweep expires them and the expiry is fanned out like an explicit
//! remove.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

struct TransientEntry {
    value: Value,
    version: u64,
    expires_at: Option<Instant>,
}

/// The transient-data map of one room. Callers hold the room lock.
#[derive(Default)]
pub struct TransientData {
    entries: HashMap<String, TransientEntry>,
    version: u64,
}

impl TransientData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value. Returns the previous value as `Some(old)` when the
    /// stored value actually changed; storing an identical value only
    /// refreshes the TTL and returns `None` so no event is fanned out.
    pub fn set(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Option<Option<Value>> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);

        if let Some(entry) = self.entries.get_mut(key) {
            if entry.value == value {
                entry.expires_at = expires_at;
                return None;
            }
            let old = std::mem::replace(&mut entry.value, value);
            self.version += 1;
            entry.version = self.version;
            entry.expires_at = expires_at;
            return Some(Some(old));
        }

        self.version += 1;
        self.entries.insert(
            key.to_string(),
            TransientEntry {
                value,
                version: self.version,
                expires_at,
            },
        );
        Some(None)
    }

    /// Remove a value, returning it if the key existed.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let entry = self.entries.remove(key)?;
        self.version += 1;
        Some(entry.value)
    }

    /// Current contents, for the `initial` snapshot sent to joining members.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Remove entries whose TTL has lapsed, returning them for fan-out.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, Value)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|value| (key, value)))
            .collect()
    }

    /// Version of the most recent change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
