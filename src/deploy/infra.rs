// ABOUTME: Infrastructure apply adapter: plan freely, apply each diff at most once.
// ABOUTME: Rejects stale diffs and classifies failed applies as clean or partial.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::infra::{ApplyOutput, DesiredState, Diff, EngineError, InfraEngine};
use crate::types::DiffId;

use super::error::{ApplyError, DeployError};

pub struct InfraAdapter {
    engine: Arc<dyn InfraEngine>,
    applied: Mutex<HashSet<DiffId>>,
}

impl std::fmt::Debug for InfraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfraAdapter")
            .field("applied", &self.applied.lock().len())
            .finish_non_exhaustive()
    }
}

impl InfraAdapter {
    pub fn new(engine: Arc<dyn InfraEngine>) -> Self {
        Self {
            engine,
            applied: Mutex::new(HashSet::new()),
        }
    }

    pub async fn check_prerequisites(&self) -> Result<(), DeployError> {
        self.engine
            .check_prerequisites()
            .await
            .map_err(|e| DeployError::Prerequisite(e.to_string()))
    }

    pub async fn plan(&self, desired: &DesiredState) -> Result<Diff, DeployError> {
        let diff = self.engine.plan(desired).await.map_err(DeployError::Plan)?;
        tracing::info!(
            environment = %diff.environment,
            diff = %diff.id,
            generation = %diff.generation,
            "planned: {}",
            diff.summary()
        );
        Ok(diff)
    }

    /// Apply `diff`. The plan artifact is discarded whatever the result.
    pub async fn apply(&self, diff: &Diff) -> Result<ApplyOutput, DeployError> {
        let result = self.apply_once(diff).await;
        self.engine.discard(diff).await;
        result.map_err(DeployError::from)
    }

    /// Drop a diff that will never be applied.
    pub async fn discard(&self, diff: &Diff) {
        self.engine.discard(diff).await;
    }

    async fn apply_once(&self, diff: &Diff) -> Result<ApplyOutput, ApplyError> {
        if !self.applied.lock().insert(diff.id.clone()) {
            return Err(ApplyError::AlreadyApplied(diff.id.clone()));
        }

        let current = self
            .engine
            .current_generation(&diff.environment, &diff.working_dir)
            .await
            .map_err(|e| ApplyError::NoChangesApplied(e.to_string()))?;
        if current != diff.generation {
            return Err(ApplyError::StaleDiff {
                diff: diff.id.clone(),
                planned: diff.generation.clone(),
                current,
            });
        }

        match self.engine.apply(diff).await {
            Ok(output) => {
                tracing::info!(
                    environment = %diff.environment,
                    generation = %output.generation,
                    "infrastructure applied"
                );
                Ok(output)
            }
            Err(EngineError::Apply {
                message,
                generation_after: Some(after),
            }) if after == diff.generation => Err(ApplyError::NoChangesApplied(message)),
            Err(EngineError::Apply { message, .. }) => Err(ApplyError::PartiallyApplied(message)),
            Err(e @ (EngineError::Prerequisite(_) | EngineError::Plan(_))) => {
                Err(ApplyError::NoChangesApplied(e.to_string()))
            }
            Err(e @ EngineError::State(_)) => Err(ApplyError::PartiallyApplied(e.to_string())),
        }
    }
}
