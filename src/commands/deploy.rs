// ABOUTME: Deploy command implementation.
// ABOUTME: Wires configured adapters into the controller and maps the outcome to an exit code.

use std::path::Path;
use std::sync::Arc;

use halyard::build::TarballBuilder;
use halyard::config::{Config, Overrides};
use halyard::deploy::{AbortReason, AbortSignal, Adapters, DeployController, DeploymentRequest};
use halyard::error::{Error, Result};
use halyard::hooks::HookRunner;
use halyard::infra::TerraformEngine;
use halyard::orchestration::EcsService;
use halyard::output::Output;
use halyard::probe::HttpProbe;
use halyard::registry::DirectoryRegistry;
use halyard::store::FileStore;
use halyard::types::VersionTag;

/// Arguments of one `halyard deploy` invocation.
#[derive(Debug, Clone)]
pub struct DeployArgs {
    pub environment: String,
    pub version: String,
    pub skip_build: bool,
    pub skip_infra: bool,
    pub overrides: Overrides,
}

/// Deploy and return the process exit code.
pub async fn deploy(project_dir: &Path, args: DeployArgs, mut output: Output) -> Result<i32> {
    let config = Config::discover(project_dir)?;
    let environment = config.environment(&args.environment)?;
    let version =
        VersionTag::new(&args.version).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let settings = config.run_settings(environment.as_str(), &args.overrides, project_dir)?;
    let registry = config.registry_target(&args.overrides)?;
    let image = config.image_repository()?;

    output.start_timer();
    output.progress(&format!(
        "Deploying {} {} to {} ({})",
        config.project, version, environment, settings.region
    ));

    let controller = build_controller(
        &config,
        project_dir,
        registry.as_deref(),
        &image,
        &settings.region,
    )
    .with_hooks(HookRunner::new(project_dir));
    let request = DeploymentRequest::builder(environment, version)
        .skip_build(args.skip_build)
        .skip_infra(args.skip_infra)
        .registry(registry)
        .build();

    let abort = AbortSignal::new();
    let cancel = abort.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.trigger(AbortReason::Cancelled);
        }
    });

    let outcome = controller.run(request, settings, abort).await;
    interrupt.abort();

    output.outcome(&outcome);
    Ok(outcome.exit_code())
}

fn build_controller(
    config: &Config,
    project_dir: &Path,
    registry: Option<&str>,
    image: &str,
    region: &str,
) -> DeployController {
    let state = Arc::new(FileStore::new(config.state_path(project_dir)));
    // Without a configured registry, already published artifacts are looked up locally.
    let registry_root = match registry {
        Some(address) => project_dir.join(address),
        None => config.state_path(project_dir).join("artifacts"),
    };

    let mut orchestrator = EcsService::new().region(region).repository(image);
    if let Some(container) = &config.container {
        orchestrator = orchestrator.container(container.clone());
    }

    DeployController::new(Adapters {
        lock_store: state.clone(),
        record_store: state,
        builder: Arc::new(TarballBuilder::new().exclude(config.artifact.exclude.clone())),
        registry: Arc::new(DirectoryRegistry::new(registry_root)),
        engine: Arc::new(TerraformEngine::new()),
        orchestrator: Arc::new(orchestrator),
        probe: Arc::new(HttpProbe::new()),
    })
}

