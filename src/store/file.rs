// ABOUTME: Filesystem-backed durable store for a single controller host.
// ABOUTME: Lock files are published with hard_link (atomic create-if-absent, never half-written).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{CorruptSnafu, IoSnafu, Lease, LockStore, RecordStore, StoreError, validate_key};
use crate::fs_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    value: String,
    expires_at: DateTime<Utc>,
}

impl LockFile {
    fn new(value: &str, ttl: Duration) -> Self {
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            value: value.to_string(),
            expires_at: Utc::now() + ttl,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        (self.expires_at - Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }
}

/// What a reader found at a lock path.
enum Observed {
    Missing,
    Corrupt,
    Entry(LockFile),
}

/// Durable store rooted at a directory.
///
/// Layout: `<root>/locks/<key>.lock` for leases and `<root>/records/<key>.json` for records.
/// Mutual exclusion holds across processes on one host; expired leases are broken by
/// renaming them to a tombstone and checking the tombstone still holds the expired value.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join("locks").join(format!("{key}.lock")))
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join("records").join(format!("{key}.json")))
    }

    async fn observe(path: &Path) -> Result<Observed, StoreError> {
        let raw = fs_atomic::read_optional(path)
            .await
            .context(IoSnafu { path })?;
        Ok(match raw {
            None => Observed::Missing,
            Some(raw) => match serde_json::from_str::<LockFile>(&raw) {
                Ok(lock) => Observed::Entry(lock),
                Err(_) => Observed::Corrupt,
            },
        })
    }

    /// Move a dead lock file out of the way. Returns false if a live lease was there instead.
    async fn break_lock(path: &Path, observed: Option<&str>) -> Result<bool, StoreError> {
        let tombstone = fs_atomic::sibling(path, "stale");
        match tokio::fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let still_dead = match (Self::observe(&tombstone).await?, observed) {
            (Observed::Entry(lock), Some(value)) => {
                lock.value == value && lock.remaining().is_none()
            }
            (Observed::Entry(lock), None) => lock.remaining().is_none(),
            (Observed::Corrupt | Observed::Missing, _) => true,
        };

        if !still_dead {
            // Another contender re-acquired between our read and rename; put it back.
            let _ = tokio::fs::hard_link(&tombstone, path).await;
        }
        let _ = fs_atomic::remove_if_exists(&tombstone).await;
        Ok(still_dead)
    }
}

#[async_trait]
impl LockStore for FileStore {
    async fn conditional_put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let path = self.lock_path(key)?;
        let contents =
            serde_json::to_vec(&LockFile::new(value, ttl)).context(CorruptSnafu { key })?;

        if fs_atomic::create_exclusive(&path, &contents)
            .await
            .context(IoSnafu { path: &path })?
        {
            return Ok(true);
        }

        let observed = match Self::observe(&path).await? {
            Observed::Entry(existing) if existing.remaining().is_some() => return Ok(false),
            Observed::Entry(existing) => {
                tracing::debug!(key, "breaking expired lock");
                Some(existing.value)
            }
            Observed::Corrupt => {
                tracing::warn!(key, "lock entry corrupted, breaking it");
                None
            }
            Observed::Missing => None,
        };

        if !Self::break_lock(&path, observed.as_deref()).await? {
            return Ok(false);
        }

        fs_atomic::create_exclusive(&path, &contents)
            .await
            .context(IoSnafu { path: &path })
    }

    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let path = self.lock_path(key)?;
        match Self::observe(&path).await? {
            Observed::Entry(existing)
                if existing.value == value && existing.remaining().is_some() =>
            {
                let contents = serde_json::to_vec(&LockFile::new(value, ttl))
                    .context(CorruptSnafu { key })?;
                fs_atomic::replace(&path, &contents)
                    .await
                    .context(IoSnafu { path: &path })?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        let path = self.lock_path(key)?;
        Ok(match Self::observe(&path).await? {
            Observed::Entry(existing) => existing.remaining().map(|remaining| Lease {
                value: existing.value,
                remaining,
            }),
            Observed::Corrupt | Observed::Missing => None,
        })
    }

    async fn delete(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.lock_path(key)?;
        if let Observed::Entry(existing) = Self::observe(&path).await?
            && existing.value == value
        {
            fs_atomic::remove_if_exists(&path)
                .await
                .context(IoSnafu { path: &path })?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.record_path(key)?;
        fs_atomic::read_optional(&path)
            .await
            .context(IoSnafu { path: &path })
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.record_path(key)?;
        fs_atomic::replace(&path, value.as_bytes())
            .await
            .context(IoSnafu { path: &path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let ttl = Duration::from_secs(60);

        assert!(store.conditional_put("dev", "a", ttl).await.unwrap());
        assert!(!store.conditional_put("dev", "b", ttl).await.unwrap());
        assert!(dir.path().join("locks/dev.lock").is_file());
    }

    #[tokio::test]
    async fn expired_lock_file_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let path = store.lock_path("dev").unwrap();
        let stale = LockFile {
            value: "old".to_string(),
            expires_at: Utc::now() - chrono::Duration::seconds(5),
        };
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        assert!(store.read("dev").await.unwrap().is_none());
        assert!(
            store
                .conditional_put("dev", "new", Duration::from_secs(60))
                .await
                .unwrap()
        );
        assert_eq!(store.read("dev").await.unwrap().unwrap().value, "new");
    }

    #[tokio::test]
    async fn corrupted_lock_file_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let path = store.lock_path("dev").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        assert!(
            store
                .conditional_put("dev", "new", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn refresh_and_delete_require_matching_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let ttl = Duration::from_secs(60);

        store.conditional_put("dev", "a", ttl).await.unwrap();
        assert!(!store.refresh("dev", "b", ttl).await.unwrap());
        assert!(store.refresh("dev", "a", ttl).await.unwrap());

        store.delete("dev", "b").await.unwrap();
        assert!(store.read("dev").await.unwrap().is_some());
        store.delete("dev", "a").await.unwrap();
        assert!(store.read("dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_are_replaced_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.save("environments/dev", r#"{"v":1}"#).await.unwrap();
        store.save("environments/dev", r#"{"v":2}"#).await.unwrap();
        assert_eq!(
            store.load("environments/dev").await.unwrap().as_deref(),
            Some(r#"{"v":2}"#)
        );
        assert!(store.load("environments/prod").await.unwrap().is_none());
    }
}
