// ABOUTME: Declarative infrastructure engine interface (plan / apply with generation tokens).
// ABOUTME: Plans are read-only; apply is the only mutating call and reports the resulting generation.

mod terraform;

pub use terraform::{TerraformEngine, generation_from_state, parse_outputs, summarize_plan};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{DiffId, EnvironmentName, SnapshotId};

/// State description handed to the engine for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub environment: EnvironmentName,
    pub working_dir: PathBuf,
    pub variables: BTreeMap<String, String>,
}

/// Result of a plan: counts per action, and the generation the plan was computed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub id: DiffId,
    pub environment: EnvironmentName,
    pub working_dir: PathBuf,
    pub additions: u32,
    pub changes: u32,
    pub deletions: u32,
    pub generation: SnapshotId,
    /// Engine-specific saved plan, if the engine writes one.
    pub plan_file: Option<PathBuf>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.additions == 0 && self.changes == 0 && self.deletions == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} to add, {} to change, {} to destroy",
            self.additions, self.changes, self.deletions
        )
    }
}

/// Successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutput {
    pub generation: SnapshotId,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("infrastructure engine prerequisites not met: {0}")]
    Prerequisite(String),

    #[error("plan failed: {0}")]
    Plan(String),

    /// Apply failed. `generation_after` is the state generation observed after the
    /// failure, if it could be read.
    #[error("apply failed: {message}")]
    Apply {
        message: String,
        generation_after: Option<SnapshotId>,
    },

    #[error("could not read infrastructure state: {0}")]
    State(String),
}

#[async_trait]
pub trait InfraEngine: Send + Sync {
    /// Verify the engine binary and credentials are usable.
    async fn check_prerequisites(&self) -> Result<(), EngineError>;

    /// Compute a diff without mutating anything.
    async fn plan(&self, desired: &DesiredState) -> Result<Diff, EngineError>;

    /// Current state generation, used to detect stale diffs.
    async fn current_generation(
        &self,
        environment: &EnvironmentName,
        working_dir: &Path,
    ) -> Result<SnapshotId, EngineError>;

    /// Apply a previously computed diff.
    async fn apply(&self, diff: &Diff) -> Result<ApplyOutput, EngineError>;

    /// Drop any artifacts a plan left behind (saved plan files).
    async fn discard(&self, diff: &Diff) {
        let _ = diff;
    }
}
