// ABOUTME: Run-level error taxonomy for deployments.
// ABOUTME: Classifies failures as retryable, rollback-triggering, or fatal for the outcome reporter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::build::BuildError;
use crate::infra::EngineError;
use crate::orchestration::OrchestrationError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::types::{Digest, DiffId, EnvironmentName, SnapshotId, VersionTag};

/// Why a run was interrupted from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The run-level deadline expired.
    Deadline,
    /// An operator cancelled the run.
    Cancelled,
    /// Lock renewal failed; another holder may own the environment.
    LockLost,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AbortReason::Deadline => "run deadline exceeded",
            AbortReason::Cancelled => "cancelled by operator",
            AbortReason::LockLost => "deployment lock lost",
        })
    }
}

/// Failures applying an infrastructure diff.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Apply failed before touching anything. Safe to retry with a fresh plan.
    #[error("apply failed, no changes were made: {0}")]
    NoChangesApplied(String),

    /// Apply failed after changing some resources. Needs reconciliation; never retried.
    #[error("apply partially applied, manual reconciliation required: {0}")]
    PartiallyApplied(String),

    /// State moved since the diff was planned.
    #[error("diff {diff} is stale: planned against {planned}, state is now {current}")]
    StaleDiff {
        diff: DiffId,
        planned: SnapshotId,
        current: SnapshotId,
    },

    #[error("diff {0} was already applied")]
    AlreadyApplied(DiffId),
}

/// Errors that end or redirect a deployment run.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("prerequisite check failed: {0}")]
    Prerequisite(String),

    #[error(
        "environment {environment} is locked by {holder} ({}s remaining)",
        .remaining.as_secs()
    )]
    LockContention {
        environment: EnvironmentName,
        holder: String,
        remaining: Duration,
    },

    #[error("lock for {environment} expired or was taken over")]
    LockExpired { environment: EnvironmentName },

    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("tag {tag} already holds {existing}, refusing to publish {attempted}")]
    TagConflict {
        tag: VersionTag,
        existing: Digest,
        attempted: Digest,
    },

    #[error("infrastructure plan failed: {0}")]
    Plan(EngineError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("rollout failed: {0}")]
    Rollout(#[from] OrchestrationError),

    #[error("rollout did not converge within {}s: {last}", .waited.as_secs())]
    RolloutTimeout { waited: Duration, last: String },

    #[error("rollout degraded: {0}")]
    RolloutDegraded(String),

    #[error("health check failed after {attempts} attempts ({successes} passed): {last}")]
    HealthCheckFailure {
        attempts: u32,
        successes: u32,
        last: String,
    },

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("no known-good revision to roll back to")]
    NoKnownGood,

    #[error("run aborted: {0}")]
    Aborted(AbortReason),

    #[error("pre-deploy hook failed: {0}")]
    Hook(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("run panicked: {0}")]
    Panicked(String),
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployErrorKind {
    Prerequisite,
    LockContention,
    LockExpired,
    Build,
    Registry,
    TagConflict,
    Plan,
    NoChangesApplied,
    PartiallyApplied,
    StaleDiff,
    Rollout,
    RolloutTimeout,
    RolloutDegraded,
    HealthCheckFailure,
    Rollback,
    NoKnownGood,
    Aborted,
    Hook,
    Store,
    Config,
    Panicked,
}

impl DeployError {
    /// Returns the error kind for programmatic handling.
    pub fn kind(&self) -> DeployErrorKind {
        match self {
            DeployError::Prerequisite(_) => DeployErrorKind::Prerequisite,
            DeployError::LockContention { .. } => DeployErrorKind::LockContention,
            DeployError::LockExpired { .. } => DeployErrorKind::LockExpired,
            DeployError::Build(_) => DeployErrorKind::Build,
            DeployError::Registry(_) => DeployErrorKind::Registry,
            DeployError::TagConflict { .. } => DeployErrorKind::TagConflict,
            DeployError::Plan(_) => DeployErrorKind::Plan,
            DeployError::Apply(ApplyError::NoChangesApplied(_)) => {
                DeployErrorKind::NoChangesApplied
            }
            DeployError::Apply(ApplyError::PartiallyApplied(_)) => {
                DeployErrorKind::PartiallyApplied
            }
            DeployError::Apply(ApplyError::StaleDiff { .. } | ApplyError::AlreadyApplied(_)) => {
                DeployErrorKind::StaleDiff
            }
            DeployError::Rollout(_) => DeployErrorKind::Rollout,
            DeployError::RolloutTimeout { .. } => DeployErrorKind::RolloutTimeout,
            DeployError::RolloutDegraded(_) => DeployErrorKind::RolloutDegraded,
            DeployError::HealthCheckFailure { .. } => DeployErrorKind::HealthCheckFailure,
            DeployError::Rollback(_) => DeployErrorKind::Rollback,
            DeployError::NoKnownGood => DeployErrorKind::NoKnownGood,
            DeployError::Aborted(_) => DeployErrorKind::Aborted,
            DeployError::Hook(_) => DeployErrorKind::Hook,
            DeployError::Store(_) => DeployErrorKind::Store,
            DeployError::Config(_) => DeployErrorKind::Config,
            DeployError::Panicked(_) => DeployErrorKind::Panicked,
        }
    }

    /// Whether the caller may retry the whole run. Never retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeployError::LockContention { .. }
                | DeployError::Apply(ApplyError::NoChangesApplied(_) | ApplyError::StaleDiff { .. })
        )
    }

    /// Whether this error, raised once the rollout has started, routes through rollback.
    pub fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            DeployError::Rollout(_)
                | DeployError::RolloutTimeout { .. }
                | DeployError::RolloutDegraded(_)
                | DeployError::HealthCheckFailure { .. }
                | DeployError::LockExpired { .. }
                | DeployError::Aborted(_)
        )
    }
}
