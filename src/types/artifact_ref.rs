// ABOUTME: Content-addressed artifact references.
// ABOUTME: An ArtifactRef pins registry/name:tag to a sha256 digest of the payload.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

use super::VersionTag;

#[derive(Debug, Error)]
pub enum ParseDigestError {
    #[error("digest must start with 'sha256:': {0}")]
    UnsupportedAlgorithm(String),

    #[error("digest must have 64 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid character in digest: {0}")]
    InvalidChar(char),
}

/// SHA-256 digest of an artifact payload, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of a payload.
    pub fn of(payload: &[u8]) -> Self {
        let hash = Sha256::digest(payload);
        let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
        Self(format!("sha256:{}", hex))
    }

    pub fn parse(input: &str) -> Result<Self, ParseDigestError> {
        let hex = input
            .strip_prefix("sha256:")
            .ok_or_else(|| ParseDigestError::UnsupportedAlgorithm(input.to_string()))?;

        if hex.len() != 64 {
            return Err(ParseDigestError::InvalidLength(hex.len()));
        }

        if let Some(c) = hex
            .chars()
            .find(|c| !c.is_ascii_digit() && !('a'..='f').contains(c))
        {
            return Err(ParseDigestError::InvalidChar(c));
        }

        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to a published, immutable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    registry: String,
    name: String,
    tag: VersionTag,
    digest: Digest,
}

impl ArtifactRef {
    pub fn new(
        registry: impl Into<String>,
        name: impl Into<String>,
        tag: VersionTag,
        digest: Digest,
    ) -> Self {
        Self {
            registry: registry.into(),
            name: name.into(),
            tag,
            digest,
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &VersionTag {
        &self.tag
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Reference without the digest, as a human would type it.
    pub fn tagged(&self) -> String {
        format!("{}/{}:{}", self.registry.trim_end_matches('/'), self.name, self.tag)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tagged(), self.digest)
    }
}
