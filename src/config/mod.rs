// ABOUTME: Configuration types and parsing for halyard.yml.
// ABOUTME: Handles YAML parsing, env var interpolation, and per-environment merging.

mod deserialize;
mod env_value;
mod healthcheck;
mod init;

pub use env_value::{EnvValue, resolve_variables};
pub use healthcheck::{HealthConfig, SuccessMode};
pub use init::{generate_template_yaml, init_config};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::build::SourceSpec;
use crate::deploy::{AddressTarget, LockSettings, RunSettings, ServiceTarget, Timeouts};
use crate::error::{Error, Result};
use crate::types::{EnvironmentName, ServiceId};
use deserialize::deserialize_environments;

pub const CONFIG_FILENAME: &str = "halyard.yml";
pub const CONFIG_FILENAME_ALT: &str = "halyard.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".halyard/config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub project: String,

    /// Lock and environment records live here.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Artifact registry. Required unless deploying with `--skip-build`.
    #[serde(default)]
    pub registry: Option<EnvValue>,

    /// Image repository ECS pulls releases from, e.g. an ECR repository URI.
    #[serde(default)]
    pub image: Option<EnvValue>,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub artifact: ArtifactConfig,

    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Fixed `cluster/service`; read from infrastructure outputs when absent.
    #[serde(default)]
    pub service: Option<String>,

    /// Container in the task definition that runs the artifact.
    #[serde(default)]
    pub container: Option<String>,

    /// Fixed service address; read from infrastructure outputs when absent.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(deserialize_with = "deserialize_environments")]
    pub environments: BTreeMap<EnvironmentName, EnvironmentConfig>,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub rollout: RolloutConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    /// Defaults to the project name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_context")]
    pub context: PathBuf,

    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            name: None,
            context: default_context(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfrastructureConfig {
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Output holding the load balancer address probed for health.
    #[serde(default = "default_address_output")]
    pub address_output: String,

    #[serde(default = "default_service_output")]
    pub service_output: String,

    #[serde(default = "default_cluster_output")]
    pub cluster_output: Option<String>,

    #[serde(default)]
    pub variables: BTreeMap<String, EnvValue>,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            address_output: default_address_output(),
            service_output: default_service_output(),
            cluster_output: default_cluster_output(),
            variables: BTreeMap::new(),
        }
    }
}

/// Per-environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub health: Option<HealthConfig>,

    #[serde(default)]
    pub variables: BTreeMap<String, EnvValue>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Defaults to a third of the TTL.
    #[serde(default, with = "humantime_serde")]
    pub renew_interval: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_lock_ttl(),
            renew_interval: None,
        }
    }
}

impl LockConfig {
    pub fn settings(&self) -> LockSettings {
        LockSettings {
            ttl: self.ttl,
            renew_interval: self.renew_interval.unwrap_or(self.ttl / 3),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_run_timeout", with = "humantime_serde")]
    pub run: Duration,

    #[serde(default = "default_rollout_timeout", with = "humantime_serde")]
    pub rollout: Duration,

    #[serde(default = "default_rollout_timeout", with = "humantime_serde")]
    pub rollback: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            run: default_run_timeout(),
            rollout: default_rollout_timeout(),
            rollback: default_rollout_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RolloutConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

/// Values given on the command line, which win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub registry: Option<String>,
    pub region: Option<String>,
    pub timeout: Option<Duration>,
    pub rollout_timeout: Option<Duration>,
    pub health_attempts: Option<u32>,
    pub holder: Option<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".halyard/state")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("infrastructure")
}

fn default_address_output() -> String {
    "alb_dns_name".to_string()
}

fn default_service_output() -> String {
    "ecs_service_name".to_string()
}

fn default_cluster_output() -> Option<String> {
    Some("ecs_cluster_name".to_string())
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(45 * 60)
}

fn default_rollout_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Operator identity recorded in lock claims.
fn default_holder() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "halyard".to_string())
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::InvalidConfig(message));

        let lock = self.lock.settings();
        if lock.ttl.is_zero() {
            return invalid("lock.ttl must be greater than zero".to_string());
        }
        if lock.renew_interval.is_zero() || lock.renew_interval >= lock.ttl {
            return invalid(format!(
                "lock.renew_interval ({}) must be shorter than lock.ttl ({})",
                humantime_serde::re::humantime::format_duration(lock.renew_interval),
                humantime_serde::re::humantime::format_duration(lock.ttl)
            ));
        }
        if self.timeouts.run > lock.ttl {
            return invalid("timeouts.run must not exceed lock.ttl".to_string());
        }

        self.health.validate().map_err(Error::InvalidConfig)?;
        for (name, environment) in &self.environments {
            if let Some(health) = &environment.health {
                health
                    .validate()
                    .map_err(|e| Error::InvalidConfig(format!("environments.{name}: {e}")))?;
            }
        }
        Ok(())
    }

    /// Declared environment names, for messages.
    pub fn environment_names(&self) -> String {
        self.environments
            .keys()
            .map(EnvironmentName::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn environment(&self, name: &str) -> Result<EnvironmentName> {
        EnvironmentName::new(name)
            .ok()
            .filter(|n| self.environments.contains_key(n))
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string(), self.environment_names()))
    }

    /// The configuration with `name`'s overrides merged in.
    pub fn for_environment(&self, name: &str) -> Result<Config> {
        let key = self.environment(name)?;
        let overrides = self
            .environments
            .get(&key)
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string(), self.environment_names()))?;

        let mut merged = self.clone();

        if let Some(ref region) = overrides.region {
            merged.region = region.clone();
        }

        // Replace health settings wholesale
        if let Some(ref health) = overrides.health {
            merged.health = health.clone();
        }

        // Deep merge variables
        for (k, v) in &overrides.variables {
            merged.infrastructure.variables.insert(k.clone(), v.clone());
        }

        if let Some(ref dir) = overrides.working_dir {
            merged.infrastructure.working_dir = dir.clone();
        }

        if overrides.service.is_some() {
            merged.service = overrides.service.clone();
        }

        if overrides.address.is_some() {
            merged.address = overrides.address.clone();
        }

        Ok(merged)
    }

    pub fn artifact_name(&self) -> &str {
        self.artifact.name.as_deref().unwrap_or(&self.project)
    }

    /// Registry target, CLI first.
    pub fn registry_target(&self, overrides: &Overrides) -> Result<Option<String>> {
        match (&overrides.registry, &self.registry) {
            (Some(registry), _) => Ok(Some(registry.clone())),
            (None, Some(value)) => value.resolve("registry").map(Some),
            (None, None) => Ok(None),
        }
    }

    /// Repository the orchestrator pulls `<repository>:<tag>` from.
    ///
    /// The artifact registry is a directory on the deploying machine, which a cluster
    /// cannot pull from, so a deploy needs this set to something that is not a path.
    pub fn image_repository(&self) -> Result<String> {
        let value = self.image.as_ref().ok_or_else(|| {
            Error::InvalidConfig(
                "`image` must name the repository ECS pulls releases from".to_string(),
            )
        })?;
        let repository = value.resolve("image")?;
        let repository = repository.trim_end_matches('/');
        if repository.is_empty()
            || repository.starts_with(['/', '.', '~'])
            || repository.contains('\\')
        {
            return Err(Error::InvalidConfig(format!(
                "image `{repository}` is a local path; ECS can only pull from an image repository"
            )));
        }
        if repository.rsplit('/').next().is_some_and(|name| name.contains([':', '@'])) {
            return Err(Error::InvalidConfig(format!(
                "image `{repository}` must not carry a tag or digest; the release version is appended"
            )));
        }
        Ok(repository.to_string())
    }

    /// Resolve everything a run in `environment` needs. Relative paths are taken
    /// from `project_dir`.
    pub fn run_settings(
        &self,
        environment: &str,
        overrides: &Overrides,
        project_dir: &Path,
    ) -> Result<RunSettings> {
        let merged = self.for_environment(environment)?;
        let variables = resolve_variables(&merged.infrastructure.variables)?;

        let mut health = merged.health.to_policy();
        if let Some(attempts) = overrides.health_attempts {
            health.attempts = attempts.max(1);
        }

        let service = match &merged.service {
            Some(id) => ServiceTarget::Fixed(ServiceId::new(id.clone())),
            None => ServiceTarget::Outputs {
                cluster: merged.infrastructure.cluster_output.clone(),
                service: merged.infrastructure.service_output.clone(),
            },
        };
        let address = match &merged.address {
            Some(address) => AddressTarget::Fixed(address.clone()),
            None => AddressTarget::Output(merged.infrastructure.address_output.clone()),
        };

        Ok(RunSettings {
            region: overrides.region.clone().unwrap_or(merged.region),
            holder: overrides.holder.clone().unwrap_or_else(default_holder),
            source: SourceSpec::new(self.artifact_name(), project_dir.join(&self.artifact.context)),
            infrastructure_dir: project_dir.join(&merged.infrastructure.working_dir),
            variables,
            service,
            address,
            health,
            lock: self.lock.settings(),
            timeouts: Timeouts {
                run: overrides.timeout.unwrap_or(self.timeouts.run),
                rollout: overrides.rollout_timeout.unwrap_or(self.timeouts.rollout),
                rollback: self.timeouts.rollback,
            },
            rollout_backoff: self.rollout.backoff,
        })
    }

    /// Where lock and record state is kept.
    pub fn state_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.state_dir)
    }
}
