// ABOUTME: Artifact registry interface with immutable tags.
// ABOUTME: Uploads are content-addressed; tagging is the single atomic step that publishes.

mod directory;

pub use directory::DirectoryRegistry;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{ArtifactRef, Digest, VersionTag};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The tag already points at an artifact. Tags are never moved.
    #[error("tag {tag} already exists (points at {existing})")]
    TagExists { tag: VersionTag, existing: Digest },

    #[error("blob {0} has not been uploaded")]
    MissingBlob(Digest),

    #[error("registry storage failed: {0}")]
    Storage(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed artifact storage with immutable tags.
///
/// Publishing is two steps: `upload` stores bytes under their digest (invisible to
/// tag lookups), then `tag` atomically binds a version tag to an uploaded digest.
/// A failed upload therefore never leaves a retrievable, partially tagged artifact.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Address recorded in artifact references (e.g. a registry host or directory).
    fn address(&self) -> &str;

    /// Store a payload under its digest. Uploading existing content is a no-op.
    async fn upload(&self, name: &str, payload: Bytes) -> Result<Digest, RegistryError>;

    /// Bind `tag` to an uploaded digest. Fails with `TagExists` if the tag is taken,
    /// even by the same digest.
    async fn tag(
        &self,
        name: &str,
        digest: &Digest,
        tag: &VersionTag,
    ) -> Result<ArtifactRef, RegistryError>;

    /// Resolve a tag to the artifact it points at.
    async fn lookup(&self, name: &str, tag: &VersionTag)
    -> Result<Option<ArtifactRef>, RegistryError>;

    /// Upload then tag.
    async fn push(
        &self,
        name: &str,
        payload: Bytes,
        tag: &VersionTag,
    ) -> Result<ArtifactRef, RegistryError> {
        let digest = self.upload(name, payload).await?;
        self.tag(name, &digest, tag).await
    }

    async fn exists(&self, name: &str, tag: &VersionTag) -> Result<bool, RegistryError> {
        Ok(self.lookup(name, tag).await?.is_some())
    }
}

/// In-memory registry for tests and dry runs. Counts uploads so callers can assert
/// that idempotent publishes don't re-upload.
#[derive(Debug)]
pub struct MemoryRegistry {
    address: String,
    blobs: Mutex<HashMap<(String, Digest), Bytes>>,
    tags: Mutex<HashMap<(String, VersionTag), Digest>>,
    uploads: AtomicUsize,
    fail_uploads: Mutex<Option<String>>,
}

impl MemoryRegistry {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            blobs: Mutex::new(HashMap::new()),
            tags: Mutex::new(HashMap::new()),
            uploads: AtomicUsize::new(0),
            fail_uploads: Mutex::new(None),
        }
    }

    /// Number of `upload` calls that stored bytes.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Make every subsequent upload fail with `Unavailable`.
    pub fn fail_uploads(&self, reason: impl Into<String>) {
        *self.fail_uploads.lock() = Some(reason.into());
    }

    pub fn blob(&self, name: &str, digest: &Digest) -> Option<Bytes> {
        self.blobs
            .lock()
            .get(&(name.to_string(), digest.clone()))
            .cloned()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn address(&self) -> &str {
        &self.address
    }

    async fn upload(&self, name: &str, payload: Bytes) -> Result<Digest, RegistryError> {
        if let Some(reason) = self.fail_uploads.lock().clone() {
            return Err(RegistryError::Unavailable(reason));
        }
        let digest = Digest::of(&payload);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .entry((name.to_string(), digest.clone()))
            .or_insert(payload);
        Ok(digest)
    }

    async fn tag(
        &self,
        name: &str,
        digest: &Digest,
        tag: &VersionTag,
    ) -> Result<ArtifactRef, RegistryError> {
        if !self
            .blobs
            .lock()
            .contains_key(&(name.to_string(), digest.clone()))
        {
            return Err(RegistryError::MissingBlob(digest.clone()));
        }

        let mut tags = self.tags.lock();
        let key = (name.to_string(), tag.clone());
        if let Some(existing) = tags.get(&key) {
            return Err(RegistryError::TagExists {
                tag: tag.clone(),
                existing: existing.clone(),
            });
        }
        tags.insert(key, digest.clone());
        Ok(ArtifactRef::new(
            &self.address,
            name,
            tag.clone(),
            digest.clone(),
        ))
    }

    async fn lookup(
        &self,
        name: &str,
        tag: &VersionTag,
    ) -> Result<Option<ArtifactRef>, RegistryError> {
        Ok(self
            .tags
            .lock()
            .get(&(name.to_string(), tag.clone()))
            .map(|digest| ArtifactRef::new(&self.address, name, tag.clone(), digest.clone())))
    }
}
