// ABOUTME: Immutable deployment request created once per invocation.
// ABOUTME: Built through a small builder so optional flags read clearly at call sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EnvironmentName, RunId, VersionTag};

/// What the operator asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    run_id: RunId,
    environment: EnvironmentName,
    version: VersionTag,
    skip_build: bool,
    skip_infra: bool,
    registry: Option<String>,
    requested_at: DateTime<Utc>,
}

impl DeploymentRequest {
    pub fn builder(environment: EnvironmentName, version: VersionTag) -> RequestBuilder {
        RequestBuilder {
            environment,
            version,
            skip_build: false,
            skip_infra: false,
            registry: None,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn environment(&self) -> &EnvironmentName {
        &self.environment
    }

    pub fn version(&self) -> &VersionTag {
        &self.version
    }

    pub fn skip_build(&self) -> bool {
        self.skip_build
    }

    pub fn skip_infra(&self) -> bool {
        self.skip_infra
    }

    /// Registry target, if one was given.
    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    environment: EnvironmentName,
    version: VersionTag,
    skip_build: bool,
    skip_infra: bool,
    registry: Option<String>,
}

impl RequestBuilder {
    pub fn skip_build(mut self, skip: bool) -> Self {
        self.skip_build = skip;
        self
    }

    pub fn skip_infra(mut self, skip: bool) -> Self {
        self.skip_infra = skip;
        self
    }

    pub fn registry(mut self, registry: Option<String>) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> DeploymentRequest {
        DeploymentRequest {
            run_id: RunId::generate(),
            environment: self.environment,
            version: self.version,
            skip_build: self.skip_build,
            skip_infra: self.skip_infra,
            registry: self.registry,
            requested_at: Utc::now(),
        }
    }
}
