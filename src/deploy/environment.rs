// ABOUTME: Durable per-environment record: known-good revision, audit trail, last outputs.
// ABOUTME: Writes require a live lock token for the same environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::infra::ApplyOutput;
use crate::store::{RecordStore, StoreError};
use crate::types::{ArtifactRef, EnvironmentName, SnapshotId, VersionTag};

use super::error::DeployError;
use super::lock::{LockManager, LockToken};
use super::report::DeploymentOutcome;

/// Rejected revisions kept for audit.
pub const REJECTED_HISTORY: usize = 20;

/// One deployable unit: an artifact plus the infrastructure generation it ran on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub version: VersionTag,
    pub artifact: ArtifactRef,
    pub snapshot: SnapshotId,
    /// When the revision passed health verification.
    pub verified_at: DateTime<Utc>,
}

/// A revision that failed and was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRevision {
    pub version: VersionTag,
    pub artifact: ArtifactRef,
    pub rejected_at: DateTime<Utc>,
    pub reason: String,
}

/// Persistent state of one deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: EnvironmentName,
    pub region: String,
    pub known_good: Option<Revision>,
    #[serde(default)]
    pub rejected: Vec<RejectedRevision>,
    /// Outputs of the last successful infrastructure apply, reused by `--skip-infra`.
    #[serde(default)]
    pub last_apply: Option<ApplyOutput>,
}

impl Environment {
    pub fn new(name: EnvironmentName, region: impl Into<String>) -> Self {
        Self {
            name,
            region: region.into(),
            known_good: None,
            rejected: Vec::new(),
            last_apply: None,
        }
    }

    /// Record a rejected revision, keeping the newest `REJECTED_HISTORY` entries.
    pub fn reject(&mut self, rejected: RejectedRevision) {
        self.rejected.push(rejected);
        if self.rejected.len() > REJECTED_HISTORY {
            let excess = self.rejected.len() - REJECTED_HISTORY;
            self.rejected.drain(..excess);
        }
    }
}

fn environment_key(name: &EnvironmentName) -> String {
    format!("environments/{name}")
}

fn outcome_key(name: &EnvironmentName) -> String {
    format!("outcomes/{name}")
}

/// Loads and saves environment records and last outcomes.
#[derive(Clone)]
pub struct EnvironmentRecords {
    records: Arc<dyn RecordStore>,
    locks: LockManager,
}

impl std::fmt::Debug for EnvironmentRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRecords").finish_non_exhaustive()
    }
}

impl EnvironmentRecords {
    pub fn new(records: Arc<dyn RecordStore>, locks: LockManager) -> Self {
        Self { records, locks }
    }

    /// Load an environment, creating a blank record on first use.
    ///
    /// `region` comes from configuration and always wins over the stored value.
    pub async fn load(
        &self,
        name: &EnvironmentName,
        region: &str,
    ) -> Result<Environment, DeployError> {
        let key = environment_key(name);
        let mut environment = match self.records.load(&key).await? {
            Some(raw) => serde_json::from_str::<Environment>(&raw)
                .map_err(|source| StoreError::Corrupt { key, source })?,
            None => Environment::new(name.clone(), region),
        };
        environment.region = region.to_string();
        Ok(environment)
    }

    /// Persist an environment. The token must be live and belong to the environment.
    pub async fn save(
        &self,
        environment: &Environment,
        token: &LockToken,
    ) -> Result<(), DeployError> {
        self.check_token(&environment.name, token).await?;
        let key = environment_key(&environment.name);
        let raw = serde_json::to_string_pretty(environment)
            .map_err(|source| StoreError::Corrupt { key: key.clone(), source })?;
        self.records.save(&key, &raw).await?;
        Ok(())
    }

    pub async fn save_outcome(
        &self,
        outcome: &DeploymentOutcome,
        token: &LockToken,
    ) -> Result<(), DeployError> {
        self.check_token(&outcome.environment, token).await?;
        let key = outcome_key(&outcome.environment);
        let raw = serde_json::to_string_pretty(outcome)
            .map_err(|source| StoreError::Corrupt { key: key.clone(), source })?;
        self.records.save(&key, &raw).await?;
        Ok(())
    }

    pub async fn last_outcome(
        &self,
        name: &EnvironmentName,
    ) -> Result<Option<DeploymentOutcome>, DeployError> {
        let key = outcome_key(name);
        match self.records.load(&key).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt { key, source })?,
            )),
            None => Ok(None),
        }
    }

    async fn check_token(
        &self,
        name: &EnvironmentName,
        token: &LockToken,
    ) -> Result<(), DeployError> {
        if token.environment() != name {
            return Err(DeployError::LockExpired {
                environment: name.clone(),
            });
        }
        self.locks.verify(token).await
    }
}
