// ABOUTME: Operator scripts run around a deployment: pre-deploy, post-deploy, and on-error.
// ABOUTME: Scripts live in .halyard/hooks and see the run through HALYARD_* environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::deploy::OutcomeStatus;
use crate::process::{CommandOutput, Invocation};
use crate::types::{EnvironmentName, RunId, VersionTag};

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Lock held, nothing built yet. A failure stops the run.
    PreDeploy,
    PostDeploy,
    /// Rolled back or failed.
    OnError,
}

impl HookPoint {
    pub fn filename(&self) -> &'static str {
        match self {
            HookPoint::PreDeploy => "pre-deploy",
            HookPoint::PostDeploy => "post-deploy",
            HookPoint::OnError => "on-error",
        }
    }

    /// Only the pre-deploy hook can stop a run; the others end up as warnings.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HookPoint::PreDeploy)
    }

    /// Hook that follows a finished run.
    pub fn after(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Succeeded => HookPoint::PostDeploy,
            OutcomeStatus::RolledBack | OutcomeStatus::Failed => HookPoint::OnError,
        }
    }
}

/// What a hook script learns about the run.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub run_id: RunId,
    pub environment: EnvironmentName,
    pub version: VersionTag,
    pub region: String,
    /// Known-good version before this run.
    pub previous_version: Option<VersionTag>,
    /// Set once the run has finished.
    pub outcome: Option<OutcomeStatus>,
    pub service_url: Option<String>,
}

impl HookContext {
    pub fn to_env(&self) -> BTreeMap<&'static str, String> {
        let mut env = BTreeMap::from([
            ("HALYARD_RUN_ID", self.run_id.to_string()),
            ("HALYARD_ENVIRONMENT", self.environment.to_string()),
            ("HALYARD_VERSION", self.version.to_string()),
            ("HALYARD_REGION", self.region.clone()),
        ]);
        if let Some(previous) = &self.previous_version {
            env.insert("HALYARD_PREVIOUS_VERSION", previous.to_string());
        }
        if let Some(outcome) = self.outcome {
            env.insert("HALYARD_OUTCOME", outcome.to_string());
        }
        if let Some(url) = &self.service_url {
            env.insert("HALYARD_SERVICE_URL", url.clone());
        }
        env
    }
}

/// A hook that ran, or tried to.
#[derive(Debug)]
pub enum HookResult {
    Passed(CommandOutput),
    Failed {
        /// One line suitable for an error or warning.
        reason: String,
        output: Option<CommandOutput>,
    },
}

impl HookResult {
    pub fn failure(&self) -> Option<&str> {
        match self {
            HookResult::Passed(_) => None,
            HookResult::Failed { reason, .. } => Some(reason),
        }
    }

    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            HookResult::Passed(output) => Some(output),
            HookResult::Failed { output, .. } => output.as_ref(),
        }
    }
}

/// Finds hook scripts under `<project>/.halyard/hooks` and runs them.
#[derive(Debug, Clone)]
pub struct HookRunner {
    project_dir: PathBuf,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Upper bound on one hook's runtime.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hook_exists(&self, point: HookPoint) -> bool {
        self.hook_path(point).is_file()
    }

    fn hook_path(&self, point: HookPoint) -> PathBuf {
        self.project_dir
            .join(".halyard")
            .join("hooks")
            .join(point.filename())
    }

    /// Run the hook for `point` from the project directory. `None` when no script exists.
    pub async fn run(&self, point: HookPoint, context: &HookContext) -> Option<HookResult> {
        let path = self.hook_path(point);
        if !path.is_file() {
            return None;
        }

        let name = point.filename();
        tracing::info!(hook = name, path = %path.display(), "running hook");

        let invocation = context.to_env().into_iter().fold(
            Invocation::new(path.to_string_lossy().into_owned()).current_dir(&self.project_dir),
            |invocation, (key, value)| invocation.env(key, value),
        );

        let result = match tokio::time::timeout(self.timeout, invocation.output()).await {
            Err(_) => HookResult::Failed {
                reason: format!(
                    "{name} hook did not finish within {}",
                    humantime_serde::re::humantime::format_duration(self.timeout)
                ),
                output: None,
            },
            Ok(Err(e)) => HookResult::Failed {
                reason: format!("{name} hook could not be started: {e}"),
                output: None,
            },
            Ok(Ok(output)) if output.success() => HookResult::Passed(output),
            Ok(Ok(output)) => HookResult::Failed {
                reason: format!("{name} hook failed: {}", output.summary()),
                output: Some(output),
            },
        };

        match result.failure() {
            None => tracing::info!(hook = name, "hook passed"),
            Some(reason) => tracing::warn!(hook = name, "{reason}"),
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(previous: Option<&str>) -> HookContext {
        HookContext {
            run_id: RunId::new("run-1"),
            environment: EnvironmentName::new("prod").unwrap(),
            version: VersionTag::new("v9").unwrap(),
            region: "eu-west-1".to_string(),
            previous_version: previous.map(|v| VersionTag::new(v).unwrap()),
            outcome: None,
            service_url: None,
        }
    }

    #[test]
    fn only_pre_deploy_is_fatal() {
        assert!(HookPoint::PreDeploy.is_fatal());
        assert!(!HookPoint::PostDeploy.is_fatal());
        assert!(!HookPoint::OnError.is_fatal());
    }

    #[test]
    fn hook_after_outcome() {
        assert_eq!(HookPoint::after(OutcomeStatus::Succeeded), HookPoint::PostDeploy);
        assert_eq!(HookPoint::after(OutcomeStatus::RolledBack), HookPoint::OnError);
        assert_eq!(HookPoint::after(OutcomeStatus::Failed), HookPoint::OnError);
    }

    #[test]
    fn context_env() {
        let env = context(Some("v8")).to_env();
        assert_eq!(env["HALYARD_ENVIRONMENT"], "prod");
        assert_eq!(env["HALYARD_VERSION"], "v9");
        assert_eq!(env["HALYARD_REGION"], "eu-west-1");
        assert_eq!(env["HALYARD_PREVIOUS_VERSION"], "v8");
        assert!(!env.contains_key("HALYARD_OUTCOME"));

        let finished = HookContext {
            outcome: Some(OutcomeStatus::RolledBack),
            service_url: Some("http://shop.elb.test".to_string()),
            ..context(None)
        };
        let env = finished.to_env();
        assert_eq!(env["HALYARD_OUTCOME"], "rolled back");
        assert_eq!(env["HALYARD_SERVICE_URL"], "http://shop.elb.test");
        assert!(!env.contains_key("HALYARD_PREVIOUS_VERSION"));
    }

    #[test]
    fn missing_hooks_dir() {
        let runner = HookRunner::new(Path::new("/nonexistent"));
        assert!(!runner.hook_exists(HookPoint::PreDeploy));
    }

    #[cfg(unix)]
    fn write_hook(project: &Path, point: HookPoint, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let hooks = project.join(".halyard").join("hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        let script = hooks.join(point.filename());
        std::fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_hook_reports_last_stderr_line() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            HookPoint::PreDeploy,
            "echo \"deploying $HALYARD_VERSION\"\necho 'maintenance window closed' >&2\nexit 3\n",
        );

        let runner = HookRunner::new(dir.path());
        let result = runner
            .run(HookPoint::PreDeploy, &context(None))
            .await
            .unwrap();

        assert_eq!(
            result.failure(),
            Some("pre-deploy hook failed: maintenance window closed")
        );
        assert_eq!(result.output().unwrap().stdout.trim(), "deploying v9");
        assert!(runner.run(HookPoint::PostDeploy, &context(None)).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hook_runs_from_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), HookPoint::PostDeploy, "test -f halyard.yml\n");
        std::fs::write(dir.path().join("halyard.yml"), "project: shop\n").unwrap();

        let result = HookRunner::new(dir.path())
            .run(HookPoint::PostDeploy, &context(None))
            .await
            .unwrap();
        assert!(result.failure().is_none(), "{result:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_hook_times_out() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), HookPoint::OnError, "sleep 5\n");

        let result = HookRunner::new(dir.path())
            .with_timeout(Duration::from_millis(200))
            .run(HookPoint::OnError, &context(None))
            .await
            .unwrap();
        assert!(result.failure().unwrap().contains("did not finish within"));
        assert!(result.output().is_none());
    }
}
