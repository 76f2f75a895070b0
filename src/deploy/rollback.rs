// ABOUTME: Rollback coordinator: redeploy the known-good revision and verify it again.
// ABOUTME: Runs to completion regardless of run aborts and never tries a third revision.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::probe::Endpoint;
use crate::types::ServiceId;

use super::environment::Revision;
use super::error::DeployError;
use super::health::{HealthVerdict, HealthVerifier};
use super::rollout::{Convergence, RolloutController};
use super::settings::HealthPolicy;

/// Budgets for the rollback revision, separate from the failed rollout's.
#[derive(Debug, Clone)]
pub struct RollbackBudget {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub health: HealthPolicy,
}

/// The known-good revision is running and healthy again.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub restored: Revision,
    pub convergence: Convergence,
    pub verdict: HealthVerdict,
}

#[derive(Debug, Clone)]
pub struct RollbackCoordinator {
    rollout: RolloutController,
    health: HealthVerifier,
}

impl RollbackCoordinator {
    pub fn new(rollout: RolloutController, health: HealthVerifier) -> Self {
        Self { rollout, health }
    }

    /// Roll `service` back to `to`.
    ///
    /// Any failure, including an unhealthy restored revision, is a `Rollback` error.
    pub async fn rollback(
        &self,
        service: &ServiceId,
        to: &Revision,
        endpoint: &Endpoint,
        budget: &RollbackBudget,
    ) -> Result<RollbackOutcome, DeployError> {
        tracing::warn!(service = %service, version = %to.version, "rolling back");
        let failed = |stage: &str, e: DeployError| {
            tracing::error!(service = %service, version = %to.version, "rollback {stage} failed: {e}");
            DeployError::Rollback(format!("{stage} of {} failed: {e}", to.version))
        };

        let handle = self
            .rollout
            .rollout(service, &to.artifact)
            .await
            .map_err(|e| failed("rollout", e))?;
        let convergence = self
            .rollout
            .await_convergence(&handle, budget.timeout, &budget.backoff, None)
            .await
            .map_err(|e| failed("rollout", e))?;
        let verdict = self
            .health
            .verify(endpoint, &budget.health, None)
            .await
            .and_then(HealthVerdict::into_result)
            .map_err(|e| failed("health verification", e))?;

        tracing::info!(service = %service, version = %to.version, "rollback healthy");
        Ok(RollbackOutcome {
            restored: to.clone(),
            convergence,
            verdict,
        })
    }
}
