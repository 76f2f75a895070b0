// ABOUTME: Deployment state types for the type state pattern.
// ABOUTME: Each state carries exactly the data that exists at that point of a run.

use std::collections::BTreeMap;
use tokio::time::Instant;

use crate::infra::Diff;
use crate::orchestration::RolloutHandle;
use crate::probe::Endpoint;
use crate::types::{ArtifactRef, ServiceId, SnapshotId};

use super::environment::Revision;
use super::health::HealthVerdict;
use super::rollout::Convergence;

/// Where the running service lives and how to probe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service: ServiceId,
    pub endpoint: Endpoint,
}

/// Initial state: lock held, nothing built or planned.
/// Available actions: `prepare()`
#[derive(Debug, Clone, Copy, Default)]
pub struct Locked;

/// Artifact published and infrastructure planned (unless skipped).
/// Available actions: `apply()`
#[derive(Debug, Clone)]
pub struct Prepared {
    pub(crate) artifact: ArtifactRef,
    pub(crate) diff: Option<Diff>,
}

/// Infrastructure converged; outputs known.
/// Available actions: `resolve_target()`
#[derive(Debug, Clone)]
pub struct Applied {
    pub(crate) artifact: ArtifactRef,
    pub(crate) generation: SnapshotId,
    pub(crate) outputs: BTreeMap<String, String>,
}

/// Service and health endpoint resolved from the outputs.
/// Available actions: `rollout()`, rollback
#[derive(Debug, Clone)]
pub struct Targeted {
    pub(crate) artifact: ArtifactRef,
    pub(crate) generation: SnapshotId,
    pub(crate) target: Target,
}

/// The orchestration service accepted the new revision.
/// Available actions: `await_convergence()`, rollback
#[derive(Debug, Clone)]
pub struct Deploying {
    pub(crate) artifact: ArtifactRef,
    pub(crate) generation: SnapshotId,
    pub(crate) target: Target,
    pub(crate) handle: RolloutHandle,
    pub(crate) started: Instant,
}

/// All instances of the new revision are running and ready.
/// Available actions: `verify()`, rollback
#[derive(Debug, Clone)]
pub struct Converged {
    pub(crate) artifact: ArtifactRef,
    pub(crate) generation: SnapshotId,
    pub(crate) target: Target,
    pub(crate) convergence: Convergence,
}

/// Health verification passed.
/// Available actions: `finish()`
#[derive(Debug, Clone)]
pub struct Verified {
    pub(crate) revision: Revision,
    pub(crate) verdict: HealthVerdict,
}

/// States in which the running service may already have been touched.
pub trait OnService {
    fn target(&self) -> &Target;
    fn artifact(&self) -> &ArtifactRef;
}

impl OnService for Targeted {
    fn target(&self) -> &Target {
        &self.target
    }

    fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }
}

impl OnService for Deploying {
    fn target(&self) -> &Target {
        &self.target
    }

    fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }
}

impl OnService for Converged {
    fn target(&self) -> &Target {
        &self.target
    }

    fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }
}
