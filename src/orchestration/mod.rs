// ABOUTME: Container-orchestration service interface: update a service, report its rollout status.
// ABOUTME: Status counts let the rollout controller decide convergence without knowing the backend.

mod ecs;

pub use ecs::{EcsService, register_request, status_from_describe};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{ArtifactRef, ServiceId};

/// A rollout that the orchestration service accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloutHandle {
    pub service: ServiceId,
    pub artifact: ArtifactRef,
    /// Backend revision the rollout targets (e.g. a task-definition ARN).
    pub revision: String,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// Revision the service is currently rolling towards.
    pub revision: Option<String>,
    pub desired: u32,
    pub running: u32,
    /// Instances of the target revision reporting ready.
    pub ready: u32,
    /// Instances of older revisions still running.
    pub draining: u32,
    /// The backend gave up on the rollout (e.g. a deployment circuit breaker tripped).
    pub failed: bool,
    pub message: Option<String>,
}

impl ServiceStatus {
    /// Desired count reached, every instance ready, old revisions drained.
    pub fn is_converged(&self) -> bool {
        !self.failed
            && self.running == self.desired
            && self.ready == self.desired
            && self.draining == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("orchestration prerequisites not met: {0}")]
    Prerequisite(String),

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("orchestration service rejected the request: {0}")]
    Rejected(String),

    #[error("orchestration service unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected response from orchestration service: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait OrchestrationService: Send + Sync {
    async fn check_prerequisites(&self) -> Result<(), OrchestrationError> {
        Ok(())
    }

    /// Point the service at a new artifact. Returns once the backend accepted the change.
    async fn update_service(
        &self,
        service: &ServiceId,
        artifact: &ArtifactRef,
    ) -> Result<RolloutHandle, OrchestrationError>;

    async fn service_status(&self, service: &ServiceId)
    -> Result<ServiceStatus, OrchestrationError>;
}
