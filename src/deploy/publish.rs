// ABOUTME: Artifact publisher: build, then upload-and-tag unless the tag already holds this content.
// ABOUTME: Republishing identical content is a no-op; different content under a taken tag is rejected.

use std::sync::Arc;

use crate::build::{ArtifactBuilder, SourceSpec};
use crate::registry::{Registry, RegistryError};
use crate::types::{ArtifactRef, Digest, VersionTag};

use super::error::DeployError;

#[derive(Clone)]
pub struct ArtifactPublisher {
    builder: Arc<dyn ArtifactBuilder>,
    registry: Arc<dyn Registry>,
}

impl std::fmt::Debug for ArtifactPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPublisher")
            .field("registry", &self.registry.address())
            .finish_non_exhaustive()
    }
}

fn conflict(tag: &VersionTag, existing: Digest, attempted: Digest) -> DeployError {
    DeployError::TagConflict {
        tag: tag.clone(),
        existing,
        attempted,
    }
}

impl ArtifactPublisher {
    pub fn new(builder: Arc<dyn ArtifactBuilder>, registry: Arc<dyn Registry>) -> Self {
        Self { builder, registry }
    }

    /// Build `source` and publish it under `tag`.
    pub async fn publish(
        &self,
        source: &SourceSpec,
        tag: &VersionTag,
    ) -> Result<ArtifactRef, DeployError> {
        let built = self.builder.build(source).await?;

        if let Some(existing) = self.registry.lookup(&source.name, tag).await? {
            if existing.digest() == &built.digest {
                tracing::info!(artifact = %existing, "tag already published with identical content");
                return Ok(existing);
            }
            return Err(conflict(tag, existing.digest().clone(), built.digest));
        }

        let digest = self.registry.upload(&source.name, built.payload).await?;
        match self.registry.tag(&source.name, &digest, tag).await {
            Ok(artifact) => {
                tracing::info!(artifact = %artifact, "published artifact");
                Ok(artifact)
            }
            // Lost a race with a concurrent publisher of the same tag.
            Err(RegistryError::TagExists { existing, .. }) if existing == digest => self
                .registry
                .lookup(&source.name, tag)
                .await?
                .ok_or_else(|| DeployError::Registry(RegistryError::MissingBlob(digest))),
            Err(RegistryError::TagExists { existing, .. }) => Err(conflict(tag, existing, digest)),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve an already published tag (used with `--skip-build`).
    pub async fn resolve(&self, name: &str, tag: &VersionTag) -> Result<ArtifactRef, DeployError> {
        self.registry.lookup(name, tag).await?.ok_or_else(|| {
            DeployError::Prerequisite(format!(
                "artifact {name}:{tag} is not in registry {}; cannot skip the build",
                self.registry.address()
            ))
        })
    }
}
