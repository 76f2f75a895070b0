// ABOUTME: State transition methods for deployment orchestration.
// ABOUTME: Each method consumes self and returns the next state, or the current one plus the error.

use chrono::Utc;
use tokio::time::Instant;

use crate::infra::{ApplyOutput, DesiredState};
use crate::probe::Endpoint;
use crate::types::ArtifactRef;

use super::Deployment;
use super::environment::Revision;
use super::error::DeployError;
use super::health::{HealthVerdict, HealthVerifier};
use super::infra::InfraAdapter;
use super::publish::ArtifactPublisher;
use super::report::{Journal, Stage, timed};
use super::rollout::RolloutController;
use super::state::{
    Applied, Converged, Deploying, Locked, Prepared, Target, Targeted, Verified,
};

/// Result type for transitions that may need rollback on failure.
pub type TransitionResult<T, S> = Result<Deployment<T>, (Deployment<S>, DeployError)>;

impl<S> Deployment<S> {
    fn transition<T>(self, state: T) -> Deployment<T> {
        Deployment {
            request: self.request,
            settings: self.settings,
            abort: self.abort,
            journal: self.journal,
            state,
        }
    }

    fn desired_state(&self) -> DesiredState {
        let mut variables = self.settings.variables.clone();
        variables.insert("environment".to_string(), self.environment().to_string());
        variables.insert("region".to_string(), self.settings.region.clone());
        DesiredState {
            environment: self.environment().clone(),
            working_dir: self.settings.infrastructure_dir.clone(),
            variables,
        }
    }
}

// =============================================================================
// Locked -> Prepared
// =============================================================================

impl Deployment<Locked> {
    /// Publish the artifact and plan infrastructure concurrently.
    ///
    /// Both run to completion; a plan that is not going to be applied is discarded.
    pub async fn prepare(
        mut self,
        publisher: &ArtifactPublisher,
        infra: &InfraAdapter,
    ) -> TransitionResult<Prepared, Locked> {
        if let Err(e) = self.abort.check() {
            return Err((self, e));
        }

        let version = self.request.version().clone();
        let source = &self.settings.source;
        let publish = timed(async {
            if self.request.skip_build() {
                tracing::info!(version = %version, "skipping build; resolving published artifact");
                publisher.resolve(&source.name, &version).await
            } else {
                publisher.publish(source, &version).await
            }
        });
        let desired = self.desired_state();
        let plan = timed(async {
            if self.request.skip_infra() {
                tracing::info!(environment = %desired.environment, "skipping infrastructure plan");
                Ok(None)
            } else {
                infra.plan(&desired).await.map(Some)
            }
        });

        let ((published, publish_took), (planned, plan_took)) = tokio::join!(publish, plan);
        self.journal.record(Stage::Publish, publish_took);
        if !self.request.skip_infra() {
            self.journal.record(Stage::Plan, plan_took);
        }

        let outcome = match (published, planned) {
            (Ok(artifact), Ok(diff)) => match self.abort.check() {
                Ok(()) => Ok((artifact, diff)),
                Err(e) => Err((e, diff)),
            },
            (Err(e), Ok(diff)) => Err((e, diff)),
            (_, Err(e)) => Err((e, None)),
        };

        match outcome {
            Ok((artifact, diff)) => {
                self.journal.artifact = Some(artifact.clone());
                Ok(self.transition(Prepared { artifact, diff }))
            }
            Err((e, diff)) => {
                if let Some(diff) = diff {
                    infra.discard(&diff).await;
                }
                Err((self, e))
            }
        }
    }
}

// =============================================================================
// Prepared -> Applied
// =============================================================================

impl Deployment<Prepared> {
    /// Apply the planned diff, or reuse `previous` outputs when infrastructure is skipped.
    ///
    /// Abort is checked before starting; an apply in flight is never interrupted.
    pub async fn apply(
        mut self,
        infra: &InfraAdapter,
        previous: Option<&ApplyOutput>,
    ) -> TransitionResult<Applied, Prepared> {
        let Some(diff) = self.state.diff.clone() else {
            return match previous {
                Some(previous) => {
                    let state = Applied {
                        artifact: self.state.artifact.clone(),
                        generation: previous.generation.clone(),
                        outputs: previous.outputs.clone(),
                    };
                    Ok(self.transition(state))
                }
                None => Err((
                    self,
                    DeployError::Prerequisite(
                        "--skip-infra needs outputs from a previous successful apply".to_string(),
                    ),
                )),
            };
        };

        if let Err(e) = self.abort.check() {
            infra.discard(&diff).await;
            return Err((self, e));
        }

        let (applied, took) = timed(infra.apply(&diff)).await;
        self.journal.record(Stage::Apply, took);
        match applied {
            Ok(output) => {
                self.journal.applied = Some(output.clone());
                let state = Applied {
                    artifact: self.state.artifact.clone(),
                    generation: output.generation,
                    outputs: output.outputs,
                };
                Ok(self.transition(state))
            }
            Err(e) => Err((self, e)),
        }
    }
}

// =============================================================================
// Applied -> Targeted
// =============================================================================

impl Deployment<Applied> {
    /// Resolve the service id and health endpoint from infrastructure outputs.
    pub fn resolve_target(mut self) -> TransitionResult<Targeted, Applied> {
        let resolved = (|| {
            let service = self.settings.service.resolve(&self.state.outputs)?;
            let address = self.settings.address.resolve(&self.state.outputs)?;
            let endpoint = Endpoint::from_address(&address, &self.settings.health.path)
                .map_err(|e| DeployError::Config(e.to_string()))?;
            Ok::<_, DeployError>(Target { service, endpoint })
        })();

        match resolved {
            Ok(target) => {
                self.journal.service_url = Some(target.endpoint.base_url());
                let state = Targeted {
                    artifact: self.state.artifact.clone(),
                    generation: self.state.generation.clone(),
                    target,
                };
                Ok(self.transition(state))
            }
            Err(e) => Err((self, e)),
        }
    }
}

// =============================================================================
// Targeted -> Deploying
// =============================================================================

impl Deployment<Targeted> {
    /// Hand the new artifact to the orchestration service.
    pub async fn rollout(self, rollout: &RolloutController) -> TransitionResult<Deploying, Targeted> {
        if let Err(e) = self.abort.check() {
            return Err((self, e));
        }

        let started = Instant::now();
        match rollout
            .rollout(&self.state.target.service, &self.state.artifact)
            .await
        {
            Ok(handle) => {
                let state = Deploying {
                    artifact: self.state.artifact.clone(),
                    generation: self.state.generation.clone(),
                    target: self.state.target.clone(),
                    handle,
                    started,
                };
                Ok(self.transition(state))
            }
            Err(e) => Err((self, e)),
        }
    }
}

// =============================================================================
// Deploying -> Converged
// =============================================================================

impl Deployment<Deploying> {
    pub async fn await_convergence(
        mut self,
        rollout: &RolloutController,
    ) -> TransitionResult<Converged, Deploying> {
        let result = rollout
            .await_convergence(
                &self.state.handle,
                self.settings.timeouts.rollout,
                &self.settings.rollout_backoff,
                Some(&self.abort),
            )
            .await;
        self.journal
            .record(Stage::Rollout, self.state.started.elapsed());

        match result {
            Ok(convergence) => {
                let state = Converged {
                    artifact: self.state.artifact.clone(),
                    generation: self.state.generation.clone(),
                    target: self.state.target.clone(),
                    convergence,
                };
                Ok(self.transition(state))
            }
            Err(e) => Err((self, e)),
        }
    }
}

// =============================================================================
// Converged -> Verified
// =============================================================================

impl Deployment<Converged> {
    pub async fn verify(mut self, health: &HealthVerifier) -> TransitionResult<Verified, Converged> {
        let (result, took) = timed(health.verify(
            &self.state.target.endpoint,
            &self.settings.health,
            Some(&self.abort),
        ))
        .await;
        self.journal.record(Stage::Verify, took);

        match result.and_then(HealthVerdict::into_result) {
            Ok(verdict) => {
                let revision = Revision {
                    version: self.request.version().clone(),
                    artifact: self.state.artifact.clone(),
                    snapshot: self.state.generation.clone(),
                    verified_at: Utc::now(),
                };
                Ok(self.transition(Verified { revision, verdict }))
            }
            Err(e) => Err((self, e)),
        }
    }
}

// =============================================================================
// Verified -> done
// =============================================================================

impl Deployment<Verified> {
    /// The verified revision, ready to become known-good.
    pub fn finish(self) -> (Revision, Journal) {
        (self.state.revision, self.journal)
    }

    pub fn artifact(&self) -> &ArtifactRef {
        &self.state.revision.artifact
    }
}
