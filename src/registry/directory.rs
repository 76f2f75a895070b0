// ABOUTME: On-disk registry: content-addressed blobs plus create-once tag files.
// ABOUTME: Layout is <root>/<name>/blobs/sha256-<hex> and <root>/<name>/tags/<tag>.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{Registry, RegistryError};
use crate::fs_atomic;
use crate::types::{ArtifactRef, Digest, VersionTag};

#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
    address: String,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let address = root.display().to_string();
        Self { root, address }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repository(&self, name: &str) -> Result<PathBuf, RegistryError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c));
        if !valid {
            return Err(RegistryError::Storage(format!(
                "invalid artifact name: {name:?}"
            )));
        }
        Ok(self.root.join(name))
    }

    fn blob_path(&self, name: &str, digest: &Digest) -> Result<PathBuf, RegistryError> {
        Ok(self
            .repository(name)?
            .join("blobs")
            .join(format!("sha256-{}", digest.hex())))
    }

    fn tag_path(&self, name: &str, tag: &VersionTag) -> Result<PathBuf, RegistryError> {
        Ok(self.repository(name)?.join("tags").join(tag.as_str()))
    }

    async fn read_tag(&self, path: &Path) -> Result<Option<Digest>, RegistryError> {
        let Some(raw) = fs_atomic::read_optional(path).await.map_err(storage(path))? else {
            return Ok(None);
        };
        Digest::parse(raw.trim())
            .map(Some)
            .map_err(|e| RegistryError::Storage(format!("corrupt tag {}: {e}", path.display())))
    }
}

fn storage(path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError + '_ {
    move |e| RegistryError::Storage(format!("{}: {e}", path.display()))
}

#[async_trait]
impl Registry for DirectoryRegistry {
    fn address(&self) -> &str {
        &self.address
    }

    async fn upload(&self, name: &str, payload: Bytes) -> Result<Digest, RegistryError> {
        let digest = Digest::of(&payload);
        let path = self.blob_path(name, &digest)?;

        if tokio::fs::try_exists(&path).await.map_err(storage(&path))? {
            tracing::debug!(artifact = name, digest = %digest.short(), "blob already present");
            return Ok(digest);
        }

        fs_atomic::replace(&path, &payload)
            .await
            .map_err(storage(&path))?;
        tracing::debug!(artifact = name, digest = %digest.short(), bytes = payload.len(), "uploaded blob");
        Ok(digest)
    }

    async fn tag(
        &self,
        name: &str,
        digest: &Digest,
        tag: &VersionTag,
    ) -> Result<ArtifactRef, RegistryError> {
        let blob = self.blob_path(name, digest)?;
        if !tokio::fs::try_exists(&blob).await.map_err(storage(&blob))? {
            return Err(RegistryError::MissingBlob(digest.clone()));
        }

        let path = self.tag_path(name, tag)?;
        let created = fs_atomic::create_exclusive(&path, digest.as_str().as_bytes())
            .await
            .map_err(storage(&path))?;

        if !created {
            let existing = self.read_tag(&path).await?.ok_or_else(|| {
                RegistryError::Storage(format!("tag {} vanished while tagging", path.display()))
            })?;
            return Err(RegistryError::TagExists {
                tag: tag.clone(),
                existing,
            });
        }

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
        let path = self.tag_path(name, tag)?;
        Ok(self
            .read_tag(&path)
            .await?
            .map(|digest| ArtifactRef::new(&self.address, name, tag.clone(), digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> VersionTag {
        VersionTag::new(s).unwrap()
    }

    #[tokio::test]
    async fn push_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirectoryRegistry::new(dir.path());

        let pushed = registry
            .push("web", Bytes::from_static(b"payload"), &tag("v1"))
            .await
            .unwrap();
        let found = registry.lookup("web", &tag("v1")).await.unwrap().unwrap();

        assert_eq!(pushed, found);
        assert!(
            dir.path()
                .join("web/blobs")
                .join(format!("sha256-{}", pushed.digest().hex()))
                .is_file()
        );
    }

    #[tokio::test]
    async fn existing_tag_is_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirectoryRegistry::new(dir.path());

        let first = registry
            .push("web", Bytes::from_static(b"one"), &tag("v1"))
            .await
            .unwrap();
        let err = registry
            .push("web", Bytes::from_static(b"two"), &tag("v1"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::TagExists { .. }));
        let found = registry.lookup("web", &tag("v1")).await.unwrap().unwrap();
        assert_eq!(found.digest(), first.digest());
    }

    #[tokio::test]
    async fn untagged_blob_is_not_visible() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirectoryRegistry::new(dir.path());

        registry
            .upload("web", Bytes::from_static(b"orphan"))
            .await
            .unwrap();
        assert!(!registry.exists("web", &tag("v1")).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirectoryRegistry::new(dir.path());
        assert!(
            registry
                .upload("../escape", Bytes::from_static(b"x"))
                .await
                .is_err()
        );
    }
}
