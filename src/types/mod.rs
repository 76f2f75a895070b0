// ABOUTME: Type-safe identifiers and validated domain types.
// ABOUTME: Uses phantom types to prevent ID confusion at compile time.

mod artifact_ref;
mod environment_name;
mod id;
mod version_tag;

pub use artifact_ref::{ArtifactRef, Digest, ParseDigestError};
pub use environment_name::{EnvironmentName, EnvironmentNameError};
pub use id::{DiffId, LeaseId, RunId, ServiceId, SnapshotId};
pub use version_tag::{VersionTag, VersionTagError};
