// ABOUTME: Config scaffolding for new projects.
// ABOUTME: Creates halyard.yml template files.

use std::path::Path;

use crate::error::{Error, Result};
use crate::types::EnvironmentName;

use super::{CONFIG_FILENAME, Config};

pub fn init_config(dir: &Path, project: Option<&str>, force: bool) -> Result<()> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }

    let project = match project {
        Some(name) => name.to_string(),
        None => project_name_for(dir),
    };
    // Project names double as artifact names, which share the environment naming rules.
    EnvironmentName::new(&project).map_err(|e| Error::InvalidConfig(e.to_string()))?;

    let yaml = generate_template_yaml(&project);
    // The template must stay loadable.
    Config::from_yaml(&yaml)?;
    std::fs::write(&config_path, yaml)?;

    Ok(())
}

/// Directory name folded into a valid project name.
fn project_name_for(dir: &Path) -> String {
    let raw = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let folded: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = folded.trim_matches('-');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.chars().take(63).collect::<String>().trim_end_matches('-').to_string()
    }
}

pub fn generate_template_yaml(project: &str) -> String {
    format!(
        r#"project: {project}
registry:
  env: HALYARD_REGISTRY
image:
  env: HALYARD_IMAGE
region: us-east-1

infrastructure:
  working_dir: infrastructure
  address_output: alb_dns_name
  service_output: ecs_service_name
  cluster_output: ecs_cluster_name

environments:
  dev:
  staging:
  prod:
    health:
      attempts: 20
      successes: 3

lock:
  ttl: 60m

timeouts:
  run: 45m
  rollout: 15m
  rollback: 15m

health:
  path: /health
  attempts: 10
  start_period: 30s
  interval: 10s
  timeout: 5s
"#
    )
}
