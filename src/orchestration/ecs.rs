// ABOUTME: Amazon ECS adapter driving the `aws ecs` CLI.
// ABOUTME: A rollout registers a task-definition revision with the new image and updates the service.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{OrchestrationError, OrchestrationService, RolloutHandle, ServiceStatus};
use crate::process::{Invocation, ProcessError};
use crate::types::{ArtifactRef, ServiceId};

/// Task-definition fields accepted back by `register-task-definition`.
const REGISTERABLE: &[&str] = &[
    "family",
    "taskRoleArn",
    "executionRoleArn",
    "networkMode",
    "containerDefinitions",
    "volumes",
    "placementConstraints",
    "requiresCompatibilities",
    "cpu",
    "memory",
    "pidMode",
    "ipcMode",
    "proxyConfiguration",
    "inferenceAccelerators",
    "ephemeralStorage",
    "runtimePlatform",
];

/// ECS service addressed as `<cluster>/<service>` (a bare name uses the `default` cluster).
#[derive(Debug, Clone)]
pub struct EcsService {
    binary: String,
    region: Option<String>,
    container: Option<String>,
    repository: Option<String>,
}

impl Default for EcsService {
    fn default() -> Self {
        Self::new()
    }
}

impl EcsService {
    pub fn new() -> Self {
        Self {
            binary: "aws".to_string(),
            region: None,
            container: None,
            repository: None,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Container whose image is replaced. Defaults to the first container definition.
    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    /// Pull releases as `<repository>:<tag>` instead of from the artifact's registry address.
    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    fn image(&self, artifact: &ArtifactRef) -> String {
        match &self.repository {
            Some(repository) => format!("{repository}:{}", artifact.tag()),
            None => artifact.tagged(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn split(service: &ServiceId) -> (&str, &str) {
        service
            .as_str()
            .split_once('/')
            .unwrap_or(("default", service.as_str()))
    }

    async fn ecs(&self, args: &[&str]) -> Result<Value, OrchestrationError> {
        let mut invocation = Invocation::new(&self.binary)
            .arg("ecs")
            .args(args.iter().copied())
            .args(["--output", "json"]);
        if let Some(region) = &self.region {
            invocation = invocation.arg("--region").arg(region);
        }

        let output = invocation.output().await.map_err(|e| match e {
            ProcessError::NotFound { .. } => OrchestrationError::Prerequisite(e.to_string()),
            ProcessError::Spawn { .. } => OrchestrationError::Unavailable(e.to_string()),
        })?;
        if !output.success() {
            let summary = output.summary();
            return Err(if summary.contains("ServiceNotFoundException") {
                OrchestrationError::NotFound(summary)
            } else if summary.contains("InvalidParameterException")
                || summary.contains("ClientException")
            {
                OrchestrationError::Rejected(summary)
            } else {
                OrchestrationError::Unavailable(summary)
            });
        }
        serde_json::from_str(&output.stdout)
            .map_err(|e| OrchestrationError::Malformed(e.to_string()))
    }

    async fn describe(&self, service: &ServiceId) -> Result<Value, OrchestrationError> {
        let (cluster, name) = Self::split(service);
        self.ecs(&[
            "describe-services",
            "--cluster",
            cluster,
            "--services",
            name,
        ])
        .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeServices {
    #[serde(default)]
    services: Vec<EcsServiceDescription>,
    #[serde(default)]
    failures: Vec<Failure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcsServiceDescription {
    #[serde(default)]
    task_definition: Option<String>,
    #[serde(default)]
    deployments: Vec<EcsDeployment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcsDeployment {
    status: String,
    task_definition: String,
    #[serde(default)]
    desired_count: u32,
    #[serde(default)]
    running_count: u32,
    #[serde(default)]
    rollout_state: Option<String>,
    #[serde(default)]
    rollout_state_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Failure {
    #[serde(default)]
    arn: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn first_service(json: Value) -> Result<EcsServiceDescription, OrchestrationError> {
    let described: DescribeServices =
        serde_json::from_value(json).map_err(|e| OrchestrationError::Malformed(e.to_string()))?;
    if let Some(failure) = described.failures.first() {
        return Err(OrchestrationError::NotFound(format!(
            "{}: {}",
            failure.arn.as_deref().unwrap_or("service"),
            failure.reason.as_deref().unwrap_or("unknown failure")
        )));
    }
    described
        .services
        .into_iter()
        .next()
        .ok_or_else(|| OrchestrationError::NotFound("no service in response".to_string()))
}

/// Status from `aws ecs describe-services` output.
///
/// The PRIMARY deployment is the target revision; its tasks count as ready once ECS
/// stops reporting the rollout as in progress. Tasks of other deployments are draining.
pub fn status_from_describe(json: Value) -> Result<ServiceStatus, OrchestrationError> {
    let service = first_service(json)?;
    let primary = service
        .deployments
        .iter()
        .find(|d| d.status == "PRIMARY")
        .ok_or_else(|| OrchestrationError::Malformed("no PRIMARY deployment".to_string()))?;

    let state = primary.rollout_state.as_deref();
    let ready = if state == Some("IN_PROGRESS") {
        0
    } else {
        primary.running_count
    };
    let draining = service
        .deployments
        .iter()
        .filter(|d| d.status != "PRIMARY")
        .map(|d| d.running_count)
        .sum();

    Ok(ServiceStatus {
        revision: Some(primary.task_definition.clone()),
        desired: primary.desired_count,
        running: primary.running_count,
        ready,
        draining,
        failed: state == Some("FAILED"),
        message: primary.rollout_state_reason.clone(),
    })
}

/// Build a `register-task-definition` request from `describe-task-definition` output,
/// swapping the image of the target container.
pub fn register_request(
    described: &Value,
    image: &str,
    container: Option<&str>,
) -> Result<Value, OrchestrationError> {
    let definition = described
        .get("taskDefinition")
        .and_then(Value::as_object)
        .ok_or_else(|| OrchestrationError::Malformed("missing taskDefinition".to_string()))?;

    let mut request: serde_json::Map<String, Value> = definition
        .iter()
        .filter(|(k, _)| REGISTERABLE.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let containers = request
        .get_mut("containerDefinitions")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| OrchestrationError::Malformed("missing containerDefinitions".to_string()))?;

    let target = match container {
        Some(name) => containers
            .iter_mut()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| {
                OrchestrationError::Rejected(format!("container {name} not in task definition"))
            })?,
        None => containers.first_mut().ok_or_else(|| {
            OrchestrationError::Malformed("task definition has no containers".to_string())
        })?,
    };
    target["image"] = Value::String(image.to_string());

    Ok(Value::Object(request))
}

#[async_trait]
impl OrchestrationService for EcsService {
    async fn check_prerequisites(&self) -> Result<(), OrchestrationError> {
        let output = Invocation::new(&self.binary)
            .args(["sts", "get-caller-identity", "--output", "json"])
            .output()
            .await
            .map_err(|e| OrchestrationError::Prerequisite(e.to_string()))?;
        if !output.success() {
            return Err(OrchestrationError::Prerequisite(format!(
                "AWS credentials not configured: {}",
                output.summary()
            )));
        }
        Ok(())
    }

    async fn update_service(
        &self,
        service: &ServiceId,
        artifact: &ArtifactRef,
    ) -> Result<RolloutHandle, OrchestrationError> {
        let (cluster, name) = Self::split(service);

        let current = first_service(self.describe(service).await?)?
            .task_definition
            .ok_or_else(|| OrchestrationError::Malformed("service has no task definition".into()))?;

        let described = self
            .ecs(&["describe-task-definition", "--task-definition", current.as_str()])
            .await?;
        let image = self.image(artifact);
        let request = register_request(&described, &image, self.container.as_deref())?;
        let request = request.to_string();

        let registered = self
            .ecs(&["register-task-definition", "--cli-input-json", request.as_str()])
            .await?;
        let revision = registered
            .pointer("/taskDefinition/taskDefinitionArn")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestrationError::Malformed("no taskDefinitionArn".to_string()))?
            .to_string();

        self.ecs(&[
            "update-service",
            "--cluster",
            cluster,
            "--service",
            name,
            "--task-definition",
            revision.as_str(),
            "--force-new-deployment",
        ])
        .await?;

        tracing::info!(service = %service, revision = %revision, image = %image, "service update accepted");
        Ok(RolloutHandle {
            service: service.clone(),
            artifact: artifact.clone(),
            revision,
            started_at: chrono::Utc::now(),
        })
    }

    async fn service_status(
        &self,
        service: &ServiceId,
    ) -> Result<ServiceStatus, OrchestrationError> {
        status_from_describe(self.describe(service).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_cluster_and_service() {
        let id = ServiceId::new("prod-cluster/web");
        assert_eq!(EcsService::split(&id), ("prod-cluster", "web"));
        let bare = ServiceId::new("web");
        assert_eq!(EcsService::split(&bare), ("default", "web"));
    }

    #[test]
    fn in_progress_rollout_is_not_ready() {
        let status = status_from_describe(json!({
            "services": [{
                "taskDefinition": "arn:td/web:8",
                "deployments": [
                    {"status": "PRIMARY", "taskDefinition": "arn:td/web:8",
                     "desiredCount": 2, "runningCount": 2, "rolloutState": "IN_PROGRESS"},
                    {"status": "ACTIVE", "taskDefinition": "arn:td/web:7",
                     "desiredCount": 0, "runningCount": 1, "rolloutState": "COMPLETED"}
                ]
            }],
            "failures": []
        }))
        .unwrap();

        assert_eq!(status.revision.as_deref(), Some("arn:td/web:8"));
        assert_eq!((status.desired, status.running, status.ready), (2, 2, 0));
        assert_eq!(status.draining, 1);
        assert!(!status.is_converged());
    }

    #[test]
    fn completed_rollout_converges() {
        let status = status_from_describe(json!({
            "services": [{"deployments": [
                {"status": "PRIMARY", "taskDefinition": "arn:td/web:8",
                 "desiredCount": 2, "runningCount": 2, "rolloutState": "COMPLETED"}
            ]}]
        }))
        .unwrap();
        assert!(status.is_converged());
    }

    #[test]
    fn failed_rollout_is_flagged() {
        let status = status_from_describe(json!({
            "services": [{"deployments": [
                {"status": "PRIMARY", "taskDefinition": "arn:td/web:8",
                 "desiredCount": 2, "runningCount": 0, "rolloutState": "FAILED",
                 "rolloutStateReason": "circuit breaker triggered"}
            ]}]
        }))
        .unwrap();
        assert!(status.failed);
        assert_eq!(status.message.as_deref(), Some("circuit breaker triggered"));
    }

    #[test]
    fn missing_service_is_not_found() {
        let err = status_from_describe(json!({
            "services": [],
            "failures": [{"arn": "arn:svc/web", "reason": "MISSING"}]
        }))
        .unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound(_)));
    }

    #[test]
    fn register_request_swaps_image_and_drops_read_only_fields() {
        let described = json!({
            "taskDefinition": {
                "taskDefinitionArn": "arn:td/web:7",
                "family": "web",
                "revision": 7,
                "status": "ACTIVE",
                "networkMode": "awsvpc",
                "containerDefinitions": [
                    {"name": "sidecar", "image": "envoy:1"},
                    {"name": "app", "image": "registry/web:v7"}
                ]
            }
        });

        let request = register_request(&described, "registry/web:v8", Some("app")).unwrap();
        assert_eq!(request["family"], "web");
        assert!(request.get("revision").is_none());
        assert!(request.get("taskDefinitionArn").is_none());
        assert_eq!(request["containerDefinitions"][0]["image"], "envoy:1");
        assert_eq!(request["containerDefinitions"][1]["image"], "registry/web:v8");
    }

    #[test]
    fn image_comes_from_repository_when_set() {
        let artifact = ArtifactRef::new(
            "/work/shop/.halyard/registry",
            "shop",
            crate::types::VersionTag::new("v8").unwrap(),
            crate::types::Digest::of(b"payload"),
        );
        assert_eq!(
            EcsService::new().image(&artifact),
            "/work/shop/.halyard/registry/shop:v8"
        );
        let ecs = EcsService::new().repository("123.dkr.ecr.eu-west-1.amazonaws.com/shop");
        assert_eq!(ecs.image(&artifact), "123.dkr.ecr.eu-west-1.amazonaws.com/shop:v8");
    }

    #[test]
    fn register_request_rejects_unknown_container() {
        let described = json!({"taskDefinition": {"containerDefinitions": [{"name": "app"}]}});
        assert!(matches!(
            register_request(&described, "img", Some("worker")),
            Err(OrchestrationError::Rejected(_))
        ));
    }
}
