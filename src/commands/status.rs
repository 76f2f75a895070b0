// ABOUTME: Status command implementation.
// ABOUTME: Shows the known-good revision, last outcome, and lock holder of one environment.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use halyard::config::Config;
use halyard::deploy::{
    DeploymentOutcome, Environment, EnvironmentRecords, LockClaim, LockManager,
};
use halyard::error::Result;
use halyard::output::{Output, OutputMode, format_duration, summary_line};
use halyard::store::FileStore;

#[derive(Serialize)]
struct StatusReport {
    environment: Environment,
    last_outcome: Option<DeploymentOutcome>,
    lock: Option<LockStatus>,
}

#[derive(Serialize)]
struct LockStatus {
    #[serde(flatten)]
    claim: LockClaim,
    #[serde(with = "humantime_serde")]
    remaining: Duration,
}

pub async fn status(project_dir: &Path, environment: &str, output: Output) -> Result<()> {
    let config = Config::discover(project_dir)?;
    let name = config.environment(environment)?;
    let region = config.for_environment(environment)?.region;

    let store = Arc::new(FileStore::new(config.state_path(project_dir)));
    let locks = LockManager::new(store.clone());
    let records = EnvironmentRecords::new(store, locks.clone());

    let report = StatusReport {
        environment: records.load(&name, &region).await?,
        last_outcome: records.last_outcome(&name).await?,
        lock: locks
            .holder(&name)
            .await?
            .map(|(claim, remaining)| LockStatus { claim, remaining }),
    };

    if output.mode() == OutputMode::Json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    let environment = &report.environment;
    println!("Environment: {} ({})", environment.name, environment.region);
    match &environment.known_good {
        Some(revision) => println!(
            "Known good:  {} ({}, verified {})",
            revision.version, revision.artifact, revision.verified_at
        ),
        None => println!("Known good:  none"),
    }
    if !environment.rejected.is_empty() {
        println!("Rejected:    {}", environment.rejected.len());
    }
    match &report.last_outcome {
        Some(outcome) => println!("Last run:    {}", summary_line(outcome)),
        None => println!("Last run:    none"),
    }
    match &report.lock {
        Some(lock) => println!(
            "Lock:        held by {} ({} left)",
            lock.claim.describe(),
            format_duration(lock.remaining)
        ),
        None => println!("Lock:        free"),
    }
    Ok(())
}
