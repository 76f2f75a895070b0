// ABOUTME: Rollout controller: hand a new artifact to the orchestration service and poll to convergence.
// ABOUTME: Polls back off exponentially; timeouts and degraded rollouts return to the caller.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::backoff::BackoffPolicy;
use crate::orchestration::{OrchestrationError, OrchestrationService, RolloutHandle, ServiceStatus};
use crate::types::{ArtifactRef, ServiceId};

use super::abort::AbortSignal;
use super::error::DeployError;

/// Rollout lifecycle as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    Requested,
    InProgress,
    Converged,
    TimedOut,
    Degraded,
}

impl RolloutState {
    fn of(status: &ServiceStatus) -> Self {
        if status.failed {
            RolloutState::Degraded
        } else if status.is_converged() {
            RolloutState::Converged
        } else {
            RolloutState::InProgress
        }
    }
}

/// A rollout that reached convergence.
#[derive(Debug, Clone)]
pub struct Convergence {
    pub polls: u32,
    pub elapsed: Duration,
    pub status: ServiceStatus,
}

fn describe(status: Option<&ServiceStatus>) -> String {
    match status {
        Some(s) => format!(
            "{}/{} running, {} ready, {} draining{}",
            s.running,
            s.desired,
            s.ready,
            s.draining,
            s.message
                .as_deref()
                .map(|m| format!(" ({m})"))
                .unwrap_or_default()
        ),
        None => "no status received".to_string(),
    }
}

#[derive(Clone)]
pub struct RolloutController {
    orchestrator: Arc<dyn OrchestrationService>,
}

impl std::fmt::Debug for RolloutController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutController").finish_non_exhaustive()
    }
}

impl RolloutController {
    pub fn new(orchestrator: Arc<dyn OrchestrationService>) -> Self {
        Self { orchestrator }
    }

    pub async fn check_prerequisites(&self) -> Result<(), DeployError> {
        self.orchestrator
            .check_prerequisites()
            .await
            .map_err(|e| DeployError::Prerequisite(e.to_string()))
    }

    /// Point `service` at `artifact`.
    pub async fn rollout(
        &self,
        service: &ServiceId,
        artifact: &ArtifactRef,
    ) -> Result<RolloutHandle, DeployError> {
        tracing::info!(service = %service, artifact = %artifact, state = ?RolloutState::Requested, "rollout requested");
        let handle = self.orchestrator.update_service(service, artifact).await?;
        tracing::info!(service = %service, revision = %handle.revision, "rollout accepted");
        Ok(handle)
    }

    /// Poll until the rollout converges, degrades, or `timeout` passes.
    ///
    /// An unavailable orchestration API counts as a poll without progress. An abort
    /// interrupts the wait between polls.
    pub async fn await_convergence(
        &self,
        handle: &RolloutHandle,
        timeout: Duration,
        backoff: &BackoffPolicy,
        abort: Option<&AbortSignal>,
    ) -> Result<Convergence, DeployError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut polls = 0u32;
        let mut state = RolloutState::Requested;
        let mut last: Option<ServiceStatus> = None;

        loop {
            polls += 1;
            match self.orchestrator.service_status(&handle.service).await {
                Ok(status) => {
                    let next = RolloutState::of(&status);
                    if next != state {
                        tracing::debug!(service = %handle.service, from = ?state, to = ?next, poll = polls, "rollout state");
                        state = next;
                    }
                    match state {
                        RolloutState::Converged => {
                            let elapsed = started.elapsed();
                            tracing::info!(service = %handle.service, polls, elapsed = ?elapsed, "rollout converged");
                            return Ok(Convergence {
                                polls,
                                elapsed,
                                status,
                            });
                        }
                        RolloutState::Degraded => {
                            return Err(DeployError::RolloutDegraded(describe(Some(&status))));
                        }
                        _ => last = Some(status),
                    }
                }
                Err(OrchestrationError::Unavailable(reason)) => {
                    tracing::warn!(service = %handle.service, poll = polls, "status unavailable: {reason}");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline || !backoff.allows(polls) {
                tracing::warn!(service = %handle.service, polls, state = ?RolloutState::TimedOut, "rollout did not converge");
                return Err(DeployError::RolloutTimeout {
                    waited: started.elapsed(),
                    last: describe(last.as_ref()),
                });
            }

            let wait = backoff.delay(polls - 1).min(deadline - now);
            match abort {
                Some(abort) => tokio::select! {
                    reason = abort.aborted() => return Err(DeployError::Aborted(reason)),
                    _ = tokio::time::sleep(wait) => {}
                },
                None => tokio::time::sleep(wait).await,
            }
        }
    }
}
