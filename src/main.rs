// ABOUTME: Entry point for the halyard CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use commands::DeployArgs;
use halyard::config::{self, Overrides};
use halyard::error::Result;
use halyard::output::{Output, OutputMode};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag; RUST_LOG wins when set
    let default = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };

    match run(cli, mode).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            Output::new(mode).error(&e.to_string());
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, mode: OutputMode) -> Result<i32> {
    let cwd = env::current_dir()?;
    let output = Output::new(mode);

    match cli.command {
        Commands::Init { project, force } => {
            config::init_config(&cwd, project.as_deref(), force)?;
            output.success(&format!("Created {}", config::CONFIG_FILENAME));
            Ok(0)
        }
        Commands::Deploy {
            environment,
            version,
            skip_build,
            skip_infra,
            registry,
            region,
            timeout,
            rollout_timeout,
            health_attempts,
        } => {
            let args = DeployArgs {
                environment,
                version,
                skip_build,
                skip_infra,
                overrides: Overrides {
                    registry,
                    region,
                    timeout,
                    rollout_timeout,
                    health_attempts,
                    holder: None,
                },
            };
            commands::deploy(&cwd, args, output).await
        }
        Commands::Status { environment } => {
            commands::status(&cwd, &environment, output).await?;
            Ok(0)
        }
    }
}
