// ABOUTME: Resolved per-run settings: budgets, timeouts, and where to find service and address.
// ABOUTME: Built from configuration plus CLI overrides; the controller never reads config directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::build::SourceSpec;
use crate::types::ServiceId;

use super::error::DeployError;

/// How many probe successes make a healthy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessThreshold {
    /// `n` passes in a row; a failure resets the streak.
    Consecutive(u32),
    /// `n` passes anywhere within the attempt budget.
    Total(u32),
}

impl SuccessThreshold {
    pub fn required(&self) -> u32 {
        match self {
            SuccessThreshold::Consecutive(n) | SuccessThreshold::Total(n) => *n,
        }
    }
}

/// Health verification budget.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    pub path: String,
    pub attempts: u32,
    pub success: SuccessThreshold,
    /// Per-attempt probe timeout.
    pub timeout: Duration,
    /// Settle delay before the first probe.
    pub start_period: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            attempts: 10,
            success: SuccessThreshold::Consecutive(1),
            timeout: Duration::from_secs(5),
            start_period: Duration::from_secs(30),
            backoff: BackoffPolicy::constant(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub ttl: Duration,
    pub renew_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Whole-run deadline.
    pub run: Duration,
    /// Convergence budget for the new revision.
    pub rollout: Duration,
    /// Convergence budget for the rollback revision.
    pub rollback: Duration,
}

/// Where the orchestration service id comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTarget {
    Fixed(ServiceId),
    /// Read from infrastructure outputs; `cluster` output is prefixed as `<cluster>/`.
    Outputs {
        cluster: Option<String>,
        service: String,
    },
}

/// Where the service's reachable address comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressTarget {
    Fixed(String),
    Output(String),
}

fn output<'a>(outputs: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str, DeployError> {
    outputs
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DeployError::Config(format!("infrastructure output {name} is missing")))
}

impl ServiceTarget {
    pub fn resolve(&self, outputs: &BTreeMap<String, String>) -> Result<ServiceId, DeployError> {
        match self {
            ServiceTarget::Fixed(id) => Ok(id.clone()),
            ServiceTarget::Outputs { cluster, service } => {
                let service = output(outputs, service)?;
                Ok(match cluster {
                    Some(cluster) => {
                        ServiceId::new(format!("{}/{service}", output(outputs, cluster)?))
                    }
                    None => ServiceId::new(service),
                })
            }
        }
    }
}

impl AddressTarget {
    pub fn resolve(&self, outputs: &BTreeMap<String, String>) -> Result<String, DeployError> {
        match self {
            AddressTarget::Fixed(address) => Ok(address.clone()),
            AddressTarget::Output(name) => output(outputs, name).map(str::to_string),
        }
    }
}

/// Everything a run needs besides the request itself.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub region: String,
    pub holder: String,
    pub source: SourceSpec,
    pub infrastructure_dir: PathBuf,
    pub variables: BTreeMap<String, String>,
    pub service: ServiceTarget,
    pub address: AddressTarget,
    pub health: HealthPolicy,
    pub lock: LockSettings,
    pub timeouts: Timeouts,
    pub rollout_backoff: BackoffPolicy,
}
