// ABOUTME: Application-wide error types for halyard.
// ABOUTME: Covers configuration, filesystem, and serialization failures outside a deployment run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("unknown environment: {0} (declared: {1})")]
    UnknownEnvironment(String, String),

    #[error("{field} needs environment variable {var}, which is not set")]
    MissingEnvVar { var: String, field: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Deploy(#[from] crate::deploy::DeployError),
}

pub type Result<T> = std::result::Result<T, Error>;
