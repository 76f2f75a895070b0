// ABOUTME: Durable store interfaces for deployment locks and environment records.
// ABOUTME: Lock writes are conditional (create-if-absent with TTL); records are plain JSON blobs.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;

/// Errors from durable store backends.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("store I/O failed at {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("corrupt store entry {key}: {source}"))]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("invalid store key: {key:?}"))]
    InvalidKey { key: String },
}

/// A live lock entry as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Opaque value written by the holder.
    pub value: String,
    /// Time left before the entry expires.
    pub remaining: Duration,
}

/// Store offering linearizable conditional writes with expiry.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Write `value` under `key` only if no live entry exists. Returns whether the write won.
    async fn conditional_put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the live entry's expiry if it still holds `value`.
    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Read the live entry under `key`. Expired entries read as `None`.
    async fn read(&self, key: &str) -> Result<Option<Lease>, StoreError>;

    /// Delete the entry if it still holds `value`. Deleting a missing, expired or foreign
    /// entry is a no-op.
    async fn delete(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Key/value records that persist across runs (known-good pointers, outcomes).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Keys are slash-separated segments of `[a-z0-9._-]`, never `.` or `..`.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        });

    if valid {
        Ok(())
    } else {
        InvalidKeySnafu { key }.fail()
    }
}
