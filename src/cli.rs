// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "halyard")]
#[command(about = "Lock-guarded deployments with health verification and automatic rollback")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print the final result
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Print JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new halyard.yml configuration file
    Init {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        project: Option<String>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Deploy a version to an environment
    Deploy {
        /// Target environment (declared in config)
        #[arg(short, long)]
        environment: String,

        /// Version tag to deploy
        #[arg(long)]
        version: String,

        /// Reuse the artifact already published for this version
        #[arg(long)]
        skip_build: bool,

        /// Skip the infrastructure plan and apply
        #[arg(long)]
        skip_infra: bool,

        /// Artifact registry (overrides config)
        #[arg(long)]
        registry: Option<String>,

        /// Region (overrides config)
        #[arg(long)]
        region: Option<String>,

        /// Whole-run deadline, e.g. 30m
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Rollout convergence deadline, e.g. 10m
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        rollout_timeout: Option<Duration>,

        /// Health probe attempts
        #[arg(long)]
        health_attempts: Option<u32>,
    },

    /// Show known-good revision, last outcome and lock holder
    Status {
        #[arg(short, long)]
        environment: String,
    },
}
