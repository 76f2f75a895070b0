// ABOUTME: Health verification settings as written in halyard.yml.
// ABOUTME: Defaults mirror a 30s settle delay followed by 10 probes 10s apart.

use serde::Deserialize;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::deploy::{HealthPolicy, SuccessThreshold};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessMode {
    /// Passes must be back to back.
    #[default]
    Consecutive,
    Total,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Passes needed for a healthy verdict.
    #[serde(default = "default_successes")]
    pub successes: u32,

    #[serde(default)]
    pub success_mode: SuccessMode,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_start_period", with = "humantime_serde")]
    pub start_period: Duration,

    /// Fixed delay between probes; ignored when `backoff` is set.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
}

fn default_path() -> String {
    "/health".to_string()
}

fn default_attempts() -> u32 {
    10
}

fn default_successes() -> u32 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_start_period() -> Duration {
    Duration::from_secs(30)
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            attempts: default_attempts(),
            successes: default_successes(),
            success_mode: SuccessMode::default(),
            timeout: default_timeout(),
            start_period: default_start_period(),
            interval: default_interval(),
            backoff: None,
        }
    }
}

impl HealthConfig {
    pub fn to_policy(&self) -> HealthPolicy {
        let success = match self.success_mode {
            SuccessMode::Consecutive => SuccessThreshold::Consecutive(self.successes),
            SuccessMode::Total => SuccessThreshold::Total(self.successes),
        };
        HealthPolicy {
            path: self.path.clone(),
            attempts: self.attempts,
            success,
            timeout: self.timeout,
            start_period: self.start_period,
            backoff: self
                .backoff
                .unwrap_or_else(|| BackoffPolicy::constant(self.interval)),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.attempts == 0 {
            return Err("health.attempts must be at least 1".to_string());
        }
        if self.successes == 0 || self.successes > self.attempts {
            return Err(format!(
                "health.successes must be between 1 and attempts ({})",
                self.attempts
            ));
        }
        if !self.path.starts_with('/') {
            return Err(format!("health.path must start with '/': {}", self.path));
        }
        Ok(())
    }
}
