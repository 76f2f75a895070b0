// ABOUTME: Terraform CLI adapter for the infrastructure engine interface.
// ABOUTME: Generation tokens are "<lineage>:<serial>" read from `terraform state pull`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ApplyOutput, DesiredState, Diff, EngineError, InfraEngine};
use crate::process::{CommandOutput, Invocation, ProcessError};
use crate::types::{DiffId, EnvironmentName, SnapshotId};

/// Generation reported when no state exists yet.
const EMPTY_GENERATION: &str = "none:0";

static PLAN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Drives the `terraform` binary in each diff's working directory.
#[derive(Debug, Clone)]
pub struct TerraformEngine {
    binary: String,
}

impl Default for TerraformEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TerraformEngine {
    pub fn new() -> Self {
        Self {
            binary: "terraform".to_string(),
        }
    }

    /// Use a different binary (e.g. `tofu`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, dir: &Path) -> Invocation {
        Invocation::new(&self.binary)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
    }

    /// Write the plan to `plan_file` and count its actions.
    async fn saved_plan(
        &self,
        dir: &Path,
        plan_file: &Path,
        variables: &BTreeMap<String, String>,
    ) -> Result<(u32, u32, u32), EngineError> {
        self.run(
            self.command(dir)
                .args(["plan", "-input=false", "-no-color"])
                .arg(format!("-out={}", plan_file.display()))
                .args(plan_args(variables)),
            EngineError::Plan,
        )
        .await?;

        let shown = self
            .run(
                self.command(dir).args(["show", "-json"]).arg(plan_file),
                EngineError::Plan,
            )
            .await?;
        summarize_plan(&shown.stdout).map_err(|e| EngineError::Plan(format!("unreadable plan: {e}")))
    }

    async fn run(
        &self,
        invocation: Invocation,
        fail: fn(String) -> EngineError,
    ) -> Result<CommandOutput, EngineError> {
        let output = invocation.output().await.map_err(|e| match e {
            ProcessError::NotFound { .. } => EngineError::Prerequisite(e.to_string()),
            ProcessError::Spawn { .. } => fail(e.to_string()),
        })?;
        if !output.success() {
            return Err(fail(output.summary()));
        }
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct ShowPlan {
    #[serde(default)]
    resource_changes: Vec<ResourceChange>,
}

#[derive(Debug, Deserialize)]
struct ResourceChange {
    change: Change,
}

#[derive(Debug, Deserialize)]
struct Change {
    actions: Vec<String>,
}

/// Count additions, changes and deletions in `terraform show -json <plan>` output.
///
/// A replacement (`delete`+`create` in either order) counts as one addition and one
/// deletion, matching terraform's own summary line.
pub fn summarize_plan(json: &str) -> Result<(u32, u32, u32), serde_json::Error> {
    let plan: ShowPlan = serde_json::from_str(json)?;
    let (mut add, mut change, mut delete) = (0, 0, 0);
    for rc in plan.resource_changes {
        for action in &rc.change.actions {
            match action.as_str() {
                "create" => add += 1,
                "update" => change += 1,
                "delete" => delete += 1,
                _ => {}
            }
        }
    }
    Ok((add, change, delete))
}

#[derive(Debug, Deserialize)]
struct StateHeader {
    lineage: String,
    serial: u64,
}

/// Generation token from `terraform state pull` output. Empty output means no state.
pub fn generation_from_state(json: &str) -> Result<SnapshotId, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(SnapshotId::new(EMPTY_GENERATION));
    }
    let header: StateHeader = serde_json::from_str(json)?;
    Ok(SnapshotId::new(format!(
        "{}:{}",
        header.lineage, header.serial
    )))
}

#[derive(Debug, Deserialize)]
struct OutputValue {
    value: serde_json::Value,
}

/// Flatten `terraform output -json` into strings. Non-string values keep their JSON form.
pub fn parse_outputs(json: &str) -> Result<BTreeMap<String, String>, serde_json::Error> {
    let raw: BTreeMap<String, OutputValue> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|(name, output)| {
            let value = match output.value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect())
}

fn plan_args(variables: &BTreeMap<String, String>) -> Vec<String> {
    variables
        .iter()
        .map(|(k, v)| format!("-var={k}={v}"))
        .collect()
}

#[async_trait]
impl InfraEngine for TerraformEngine {
    async fn check_prerequisites(&self) -> Result<(), EngineError> {
        let output = Invocation::new(&self.binary)
            .arg("version")
            .output()
            .await
            .map_err(|e| EngineError::Prerequisite(e.to_string()))?;
        if !output.success() {
            return Err(EngineError::Prerequisite(format!(
                "{} version failed: {}",
                self.binary,
                output.summary()
            )));
        }
        Ok(())
    }

    async fn plan(&self, desired: &DesiredState) -> Result<Diff, EngineError> {
        let dir = &desired.working_dir;
        self.run(
            self.command(dir).args(["init", "-input=false", "-no-color"]),
            EngineError::Plan,
        )
        .await?;

        let generation = self.current_generation(&desired.environment, dir).await?;

        let n = PLAN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = DiffId::new(format!(
            "{}-{}-{}-{n}",
            desired.environment,
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            std::process::id()
        ));
        let plan_file = dir.join(format!(".halyard-{id}.tfplan"));

        let (additions, changes, deletions) =
            match self.saved_plan(dir, &plan_file, &desired.variables).await {
                Ok(summary) => summary,
                Err(e) => {
                    remove_plan(&plan_file).await;
                    return Err(e);
                }
            };

        Ok(Diff {
            id,
            environment: desired.environment.clone(),
            working_dir: dir.clone(),
            additions,
            changes,
            deletions,
            generation,
            plan_file: Some(plan_file),
        })
    }

    async fn current_generation(
        &self,
        _environment: &EnvironmentName,
        working_dir: &Path,
    ) -> Result<SnapshotId, EngineError> {
        let pulled = self
            .run(
                self.command(working_dir).args(["state", "pull"]),
                EngineError::State,
            )
            .await?;
        generation_from_state(&pulled.stdout).map_err(|e| EngineError::State(e.to_string()))
    }

    async fn apply(&self, diff: &Diff) -> Result<ApplyOutput, EngineError> {
        let dir = &diff.working_dir;
        let plan_file = diff
            .plan_file
            .as_ref()
            .ok_or_else(|| EngineError::Apply {
                message: "diff has no saved plan".to_string(),
                generation_after: None,
            })?;

        let applied = self
            .command(dir)
            .args(["apply", "-input=false", "-no-color", "-auto-approve"])
            .arg(plan_file)
            .output()
            .await;

        let failure = match applied {
            Ok(out) if out.success() => None,
            Ok(out) => Some(out.summary()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = failure {
            let generation_after = self
                .current_generation(&diff.environment, dir)
                .await
                .ok();
            return Err(EngineError::Apply {
                message,
                generation_after,
            });
        }

        let generation = self.current_generation(&diff.environment, dir).await?;
        let outputs = self
            .run(self.command(dir).args(["output", "-json"]), EngineError::State)
            .await?;
        let outputs =
            parse_outputs(&outputs.stdout).map_err(|e| EngineError::State(e.to_string()))?;

        Ok(ApplyOutput {
            generation,
            outputs,
        })
    }

    async fn discard(&self, diff: &Diff) {
        if let Some(plan_file) = &diff.plan_file {
            remove_plan(plan_file).await;
        }
    }
}

async fn remove_plan(plan_file: &Path) {
    if let Err(e) = crate::fs_atomic::remove_if_exists(plan_file).await {
        tracing::debug!(plan = %plan_file.display(), "failed to remove plan file: {e}");
    }
}
