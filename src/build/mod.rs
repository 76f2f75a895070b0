// ABOUTME: Artifact build interface: turns a source description into content-addressed bytes.
// ABOUTME: Builds must be pure functions of their source so identical inputs yield identical digests.

mod tarball;

pub use tarball::TarballBuilder;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

use crate::types::Digest;

/// What to build: an artifact name and the directory holding its sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub context: PathBuf,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            context: context.into(),
        }
    }
}

/// Output of a build: the payload and its digest.
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    pub digest: Digest,
    pub payload: Bytes,
}

impl BuiltArtifact {
    pub fn new(payload: Bytes) -> Self {
        Self {
            digest: Digest::of(&payload),
            payload,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("packaging failed: {0}")]
    Packaging(String),
}

#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, source: &SourceSpec) -> Result<BuiltArtifact, BuildError>;
}
