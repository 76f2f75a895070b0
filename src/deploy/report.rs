// ABOUTME: Outcome reporter: folds a finished run into one DeploymentOutcome and persists it.
// ABOUTME: Moves the known-good pointer only on success; rollbacks are recorded for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::diagnostics::{Diagnostics, Warning};
use crate::infra::ApplyOutput;
use crate::types::{ArtifactRef, EnvironmentName, RunId, VersionTag};

use super::environment::{Environment, EnvironmentRecords, RejectedRevision, Revision};
use super::error::{DeployError, DeployErrorKind};
use super::lock::LockToken;
use super::request::DeploymentRequest;

/// Exit code for a run that rolled back to the known-good revision.
pub const EXIT_ROLLED_BACK: i32 = 3;
/// Exit code when another holder owns the environment lock.
pub const EXIT_LOCK_CONTENTION: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    RolledBack,
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::RolledBack => "rolled back",
            OutcomeStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prerequisites,
    Lock,
    PreDeployHook,
    Publish,
    Plan,
    Apply,
    Rollout,
    Verify,
    Rollback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Prerequisites => "prerequisites",
            Stage::Lock => "lock",
            Stage::PreDeployHook => "pre-deploy hook",
            Stage::Publish => "publish",
            Stage::Plan => "plan",
            Stage::Apply => "apply",
            Stage::Rollout => "rollout",
            Stage::Verify => "verify",
            Stage::Rollback => "rollback",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// The single terminal record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub run_id: RunId,
    pub environment: EnvironmentName,
    pub region: String,
    pub version: VersionTag,
    pub status: OutcomeStatus,
    pub error_kind: Option<DeployErrorKind>,
    /// Human-readable reason when not succeeded.
    pub failure: Option<String>,
    pub rollback_failure: Option<String>,
    /// The environment may be serving nothing healthy; needs an operator now.
    pub incident: bool,
    pub stages: Vec<StageTiming>,
    #[serde(with = "humantime_serde")]
    pub total: Duration,
    pub artifact: Option<ArtifactRef>,
    /// Version restored by a rollback.
    pub restored_version: Option<VersionTag>,
    pub service_url: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
}

impl DeploymentOutcome {
    pub fn exit_code(&self) -> i32 {
        match (self.status, self.error_kind) {
            (OutcomeStatus::Succeeded, _) => 0,
            (OutcomeStatus::RolledBack, _) => EXIT_ROLLED_BACK,
            (OutcomeStatus::Failed, Some(DeployErrorKind::LockContention)) => EXIT_LOCK_CONTENTION,
            (OutcomeStatus::Failed, _) => 1,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

/// How a run ended, before reporting.
#[derive(Debug)]
pub enum RunResult {
    /// The new revision passed health verification.
    Succeeded(Revision),
    /// `cause` forced a rollback that restored `restored`.
    RolledBack {
        rejected: ArtifactRef,
        cause: DeployError,
        restored: Revision,
    },
    Failed {
        error: DeployError,
        rollback_failure: Option<DeployError>,
    },
}

/// Facts gathered while driving a run.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    pub stages: Vec<StageTiming>,
    pub artifact: Option<ArtifactRef>,
    pub service_url: Option<String>,
    /// Output of an infrastructure apply performed by this run.
    pub applied: Option<ApplyOutput>,
}

impl Journal {
    pub fn record(&mut self, stage: Stage, duration: Duration) {
        tracing::debug!(?stage, ?duration, "stage finished");
        self.stages.push(StageTiming { stage, duration });
    }
}

/// Await `future`, measuring how long it took.
pub(crate) async fn timed<F: std::future::Future>(future: F) -> (F::Output, Duration) {
    let started = tokio::time::Instant::now();
    let output = future.await;
    (output, started.elapsed())
}

/// A finished run, ready for reporting.
#[derive(Debug)]
pub struct RunReport {
    pub request: DeploymentRequest,
    pub region: String,
    pub journal: Journal,
    pub result: RunResult,
}

impl RunReport {
    pub fn new(
        request: DeploymentRequest,
        region: impl Into<String>,
        journal: Journal,
        result: RunResult,
    ) -> Self {
        Self {
            request,
            region: region.into(),
            journal,
            result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutcomeReporter {
    records: EnvironmentRecords,
}

impl OutcomeReporter {
    pub fn new(records: EnvironmentRecords) -> Self {
        Self { records }
    }

    /// Build the outcome and, when the lock is still held, persist it and the
    /// environment changes. Persistence problems become warnings; this never fails.
    pub async fn finalize(
        &self,
        report: RunReport,
        environment: Option<Environment>,
        token: Option<&LockToken>,
        diagnostics: &mut Diagnostics,
    ) -> DeploymentOutcome {
        let RunReport {
            request,
            region,
            journal:
                Journal {
                    stages,
                    artifact,
                    service_url,
                    applied,
                },
            result,
        } = report;

        if let (Some(mut environment), Some(token)) = (environment, token) {
            let mut changed = false;
            if let Some(applied) = applied {
                environment.last_apply = Some(applied);
                changed = true;
            }
            match &result {
                RunResult::Succeeded(revision) => {
                    environment.known_good = Some(revision.clone());
                    changed = true;
                }
                RunResult::RolledBack {
                    rejected, cause, ..
                } => {
                    environment.reject(RejectedRevision {
                        version: request.version().clone(),
                        artifact: rejected.clone(),
                        rejected_at: Utc::now(),
                        reason: cause.to_string(),
                    });
                    changed = true;
                }
                RunResult::Failed { .. } => {}
            }
            if changed && let Err(e) = self.records.save(&environment, token).await {
                diagnostics.warn(Warning::record(format!(
                    "failed to update environment record for {}: {e}",
                    environment.name
                )));
            }
        }

        let (status, error_kind, failure, rollback_failure, restored_version) = match &result {
            RunResult::Succeeded(_) => (OutcomeStatus::Succeeded, None, None, None, None),
            RunResult::RolledBack {
                cause, restored, ..
            } => (
                OutcomeStatus::RolledBack,
                Some(cause.kind()),
                Some(cause.to_string()),
                None,
                Some(restored.version.clone()),
            ),
            RunResult::Failed {
                error,
                rollback_failure,
            } => (
                OutcomeStatus::Failed,
                Some(error.kind()),
                Some(error.to_string()),
                rollback_failure.as_ref().map(ToString::to_string),
                None,
            ),
        };
        let incident = rollback_failure.is_some();
        let finished_at = Utc::now();

        let mut outcome = DeploymentOutcome {
            run_id: request.run_id().clone(),
            environment: request.environment().clone(),
            region,
            version: request.version().clone(),
            status,
            error_kind,
            failure,
            rollback_failure,
            incident,
            stages,
            total: (finished_at - request.requested_at())
                .to_std()
                .unwrap_or_default(),
            artifact,
            restored_version,
            service_url,
            requested_at: request.requested_at(),
            finished_at,
            warnings: Vec::new(),
        };

        if let Some(token) = token
            && let Err(e) = self.records.save_outcome(&outcome, token).await
        {
            diagnostics.warn(Warning::record(format!("failed to persist outcome: {e}")));
        }
        outcome.warnings = diagnostics.warnings().to_vec();

        match outcome.status {
            OutcomeStatus::Succeeded => {
                tracing::info!(environment = %outcome.environment, version = %outcome.version, "deployment succeeded")
            }
            OutcomeStatus::RolledBack => {
                tracing::warn!(environment = %outcome.environment, version = %outcome.version, "deployment rolled back")
            }
            OutcomeStatus::Failed if outcome.incident => {
                tracing::error!(environment = %outcome.environment, version = %outcome.version, "rollback failed; environment needs attention")
            }
            OutcomeStatus::Failed => {
                tracing::error!(environment = %outcome.environment, version = %outcome.version, "deployment failed")
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::lock::LockManager;
    use crate::store::MemoryStore;
    use crate::types::{Digest, SnapshotId};
    use std::sync::Arc;

    fn revision(tag: &str) -> Revision {
        let version = VersionTag::new(tag).unwrap();
        Revision {
            artifact: ArtifactRef::new("mem", "web", version.clone(), Digest::of(tag.as_bytes())),
            version,
            snapshot: SnapshotId::new("l:1"),
            verified_at: Utc::now(),
        }
    }

    fn request(env: &str, tag: &str) -> DeploymentRequest {
        DeploymentRequest::builder(
            EnvironmentName::new(env).unwrap(),
            VersionTag::new(tag).unwrap(),
        )
        .build()
    }

    #[tokio::test]
    async fn rolled_back_keeps_known_good_and_records_rejection() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone());
        let records = EnvironmentRecords::new(store, locks.clone());
        let reporter = OutcomeReporter::new(records.clone());
        let prod = EnvironmentName::new("prod").unwrap();
        let token = locks
            .acquire(&prod, "ci", Duration::from_secs(60))
            .await
            .unwrap();

        let mut env = records.load(&prod, "eu-west-1").await.unwrap();
        env.known_good = Some(revision("v8"));

        let v9 = revision("v9");
        let report = RunReport::new(
            request("prod", "v9"),
            "eu-west-1",
            Journal::default(),
            RunResult::RolledBack {
                rejected: v9.artifact,
                cause: DeployError::HealthCheckFailure {
                    attempts: 5,
                    successes: 0,
                    last: "HTTP 503".into(),
                },
                restored: revision("v8"),
            },
        );
        let mut diagnostics = Diagnostics::default();
        let outcome = reporter
            .finalize(report, Some(env), Some(&token), &mut diagnostics)
            .await;

        assert_eq!(outcome.status, OutcomeStatus::RolledBack);
        assert_eq!(outcome.exit_code(), EXIT_ROLLED_BACK);
        assert_eq!(outcome.restored_version.as_ref().unwrap().as_str(), "v8");
        assert!(diagnostics.is_empty());

        let stored = records.load(&prod, "eu-west-1").await.unwrap();
        assert_eq!(stored.known_good.unwrap().version.as_str(), "v8");
        assert_eq!(stored.rejected.len(), 1);
        assert_eq!(stored.rejected[0].version.as_str(), "v9");
        assert_eq!(records.last_outcome(&prod).await.unwrap(), Some(outcome));
    }

    #[tokio::test]
    async fn outcome_without_lock_is_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let records = EnvironmentRecords::new(store.clone(), LockManager::new(store));
        let reporter = OutcomeReporter::new(records.clone());
        let report = RunReport::new(
            request("staging", "v3"),
            "us-east-1",
            Journal::default(),
            RunResult::Failed {
                error: DeployError::LockContention {
                    environment: EnvironmentName::new("staging").unwrap(),
                    holder: "alice on build-1 (pid 7)".into(),
                    remaining: Duration::from_secs(40),
                },
                rollback_failure: None,
            },
        );

        let outcome = reporter
            .finalize(report, None, None, &mut Diagnostics::default())
            .await;

        assert_eq!(outcome.exit_code(), EXIT_LOCK_CONTENTION);
        assert!(outcome.failure.unwrap().contains("40s remaining"));
        let staging = EnvironmentName::new("staging").unwrap();
        assert_eq!(records.last_outcome(&staging).await.unwrap(), None);
    }

    #[test]
    fn failed_rollback_is_an_incident_with_generic_exit_code() {
        let outcome = DeploymentOutcome {
            run_id: RunId::new("r"),
            environment: EnvironmentName::new("prod").unwrap(),
            region: "eu-west-1".into(),
            version: VersionTag::new("v9").unwrap(),
            status: OutcomeStatus::Failed,
            error_kind: Some(DeployErrorKind::HealthCheckFailure),
            failure: Some("health check failed".into()),
            rollback_failure: Some("rollback failed".into()),
            incident: true,
            stages: vec![],
            total: Duration::ZERO,
            artifact: None,
            restored_version: None,
            service_url: None,
            requested_at: Utc::now(),
            finished_at: Utc::now(),
            warnings: vec![],
        };
        assert_eq!(outcome.exit_code(), 1);
    }
}
