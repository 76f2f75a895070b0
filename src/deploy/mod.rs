// ABOUTME: Deployment orchestration using the type state pattern.
// ABOUTME: Exports the controller, its components, and the state types of a run.

mod abort;
mod controller;
mod deployment;
mod environment;
mod error;
mod health;
mod infra;
mod lock;
mod publish;
mod report;
mod request;
mod rollback;
mod rollout;
mod settings;
mod state;
mod transitions;

pub use abort::{AbortSignal, DeadlineGuard};
pub use controller::{Adapters, DeployController};
pub use deployment::Deployment;
pub use environment::{
    Environment, EnvironmentRecords, REJECTED_HISTORY, RejectedRevision, Revision,
};
pub use error::{AbortReason, ApplyError, DeployError, DeployErrorKind};
pub use health::{HealthCheckResult, HealthVerdict, HealthVerifier, ProbeOutcome};
pub use infra::InfraAdapter;
pub use lock::{LeaseKeeper, LockClaim, LockManager, LockToken};
pub use publish::ArtifactPublisher;
pub use report::{
    DeploymentOutcome, EXIT_LOCK_CONTENTION, EXIT_ROLLED_BACK, Journal, OutcomeReporter,
    OutcomeStatus, RunReport, RunResult, Stage, StageTiming,
};
pub use request::{DeploymentRequest, RequestBuilder};
pub use rollback::{RollbackBudget, RollbackCoordinator, RollbackOutcome};
pub use rollout::{Convergence, RolloutController, RolloutState};
pub use settings::{
    AddressTarget, HealthPolicy, LockSettings, RunSettings, ServiceTarget, SuccessThreshold,
    Timeouts,
};
pub use state::{
    Applied, Converged, Deploying, Locked, OnService, Prepared, Target, Targeted, Verified,
};
pub use transitions::TransitionResult;
