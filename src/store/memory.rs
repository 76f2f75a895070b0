// ABOUTME: In-process durable store used by tests and single-process embedding.
// ABOUTME: A single mutex makes every conditional write linearizable.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{Lease, LockStore, RecordStore, StoreError, validate_key};

#[derive(Debug, Clone)]
struct LockEntry {
    value: String,
    expires_at: Instant,
}

impl LockEntry {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        let left = self.expires_at.saturating_duration_since(now);
        (!left.is_zero()).then_some(left)
    }
}

/// In-memory store.
///
/// Expiry uses `tokio::time::Instant`, so tests running with a paused clock can
/// advance time to expire leases deterministically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    locks: Mutex<HashMap<String, LockEntry>>,
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn conditional_put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        validate_key(key)?;
        let now = Instant::now();
        let mut locks = self.locks.lock();

        if locks.get(key).and_then(|e| e.remaining(now)).is_some() {
            return Ok(false);
        }

        locks.insert(
            key.to_string(),
            LockEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        validate_key(key)?;
        let now = Instant::now();
        let mut locks = self.locks.lock();

        match locks.get_mut(key) {
            Some(entry) if entry.value == value && entry.remaining(now).is_some() => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        validate_key(key)?;
        let now = Instant::now();
        let locks = self.locks.lock();

        Ok(locks.get(key).and_then(|entry| {
            entry.remaining(now).map(|remaining| Lease {
                value: entry.value.clone(),
                remaining,
            })
        }))
    }

    async fn delete(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut locks = self.locks.lock();
        if locks.get(key).is_some_and(|entry| entry.value == value) {
            locks.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        Ok(self.records.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.records
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
