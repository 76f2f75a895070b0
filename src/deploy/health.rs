// ABOUTME: Health verifier: bounded, backed-off liveness probing after convergence.
// ABOUTME: Probing stops once the success threshold is reached or can no longer be reached.

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::probe::{Endpoint, HealthProbe};

use super::abort::AbortSignal;
use super::error::DeployError;
use super::settings::{HealthPolicy, SuccessThreshold};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Pass,
    Fail,
}

/// One probe attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    /// One-based.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// HTTP status, if a response arrived.
    pub raw_status: Option<u16>,
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn passed(&self) -> bool {
        self.outcome == ProbeOutcome::Pass
    }

    fn describe(&self) -> String {
        match (&self.error, self.raw_status) {
            (Some(error), _) => error.clone(),
            (None, Some(status)) => format!("HTTP {status}"),
            (None, None) => "no response".to_string(),
        }
    }
}

/// Result of a verification run.
#[derive(Debug, Clone, Serialize)]
pub struct HealthVerdict {
    pub passed: bool,
    pub successes: u32,
    pub results: NonEmpty<HealthCheckResult>,
}

impl HealthVerdict {
    pub fn attempts(&self) -> u32 {
        self.results.len() as u32
    }

    /// `Err(HealthCheckFailure)` unless the verdict passed.
    pub fn into_result(self) -> Result<HealthVerdict, DeployError> {
        if self.passed {
            return Ok(self);
        }
        Err(DeployError::HealthCheckFailure {
            attempts: self.attempts(),
            successes: self.successes,
            last: self.results.last().describe(),
        })
    }
}

#[derive(Debug)]
struct Tally {
    threshold: SuccessThreshold,
    streak: u32,
    total: u32,
}

impl Tally {
    fn new(threshold: SuccessThreshold) -> Self {
        Self {
            threshold,
            streak: 0,
            total: 0,
        }
    }

    fn record(&mut self, result: &HealthCheckResult) {
        if result.passed() {
            self.streak += 1;
            self.total += 1;
        } else {
            self.streak = 0;
        }
    }

    fn counted(&self) -> u32 {
        match self.threshold {
            SuccessThreshold::Consecutive(_) => self.streak,
            SuccessThreshold::Total(_) => self.total,
        }
    }

    fn passed(&self) -> bool {
        self.counted() >= self.threshold.required().max(1)
    }

    /// Whether `remaining` more passes could still meet the threshold.
    fn reachable(&self, remaining: u32) -> bool {
        self.counted() + remaining >= self.threshold.required().max(1)
    }
}

async fn pause(wait: Duration, abort: Option<&AbortSignal>) -> Result<(), DeployError> {
    match abort {
        Some(abort) => tokio::select! {
            reason = abort.aborted() => Err(DeployError::Aborted(reason)),
            _ = tokio::time::sleep(wait) => Ok(()),
        },
        None => {
            tokio::time::sleep(wait).await;
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct HealthVerifier {
    probe: Arc<dyn HealthProbe>,
}

impl std::fmt::Debug for HealthVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthVerifier").finish_non_exhaustive()
    }
}

impl HealthVerifier {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// Probe `endpoint` until the policy's success threshold is met or its attempts run out.
    ///
    /// Must only be called after the rollout converged. Returns `Err` only when aborted;
    /// a failed verdict is returned as `Ok` with `passed == false`.
    pub async fn verify(
        &self,
        endpoint: &Endpoint,
        policy: &HealthPolicy,
        abort: Option<&AbortSignal>,
    ) -> Result<HealthVerdict, DeployError> {
        let attempts = policy.attempts.max(1);
        if !policy.start_period.is_zero() {
            tracing::info!(endpoint = %endpoint, "waiting {:?} before first probe", policy.start_period);
            pause(policy.start_period, abort).await?;
        }

        let mut tally = Tally::new(policy.success);
        let first = self.attempt(endpoint, policy, 1).await;
        tally.record(&first);
        let mut results = NonEmpty::new(first);

        let mut attempt = 1;
        while !tally.passed() && attempt < attempts {
            if !tally.reachable(attempts - attempt) {
                tracing::info!(
                    endpoint = %endpoint,
                    attempts = attempt,
                    remaining = attempts - attempt,
                    "success threshold out of reach, skipping remaining probes"
                );
                break;
            }
            pause(policy.backoff.delay(attempt - 1), abort).await?;
            attempt += 1;
            let result = self.attempt(endpoint, policy, attempt).await;
            tally.record(&result);
            results.push(result);
        }

        let passed = tally.passed();
        if passed {
            tracing::info!(endpoint = %endpoint, attempts = attempt, "health check passed");
        } else {
            tracing::warn!(endpoint = %endpoint, attempts = attempt, successes = tally.total, "health check failed");
        }
        Ok(HealthVerdict {
            passed,
            successes: tally.total,
            results,
        })
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        policy: &HealthPolicy,
        attempt: u32,
    ) -> HealthCheckResult {
        let at = Utc::now();
        let started = Instant::now();
        let (outcome, raw_status, error) =
            match tokio::time::timeout(policy.timeout, self.probe.probe(endpoint)).await {
                Ok(Ok(response)) if response.is_healthy() => {
                    (ProbeOutcome::Pass, Some(response.status), None)
                }
                Ok(Ok(response)) => (ProbeOutcome::Fail, Some(response.status), None),
                Ok(Err(e)) => (ProbeOutcome::Fail, None, Some(e.to_string())),
                Err(_) => (
                    ProbeOutcome::Fail,
                    None,
                    Some(format!("timed out after {:?}", policy.timeout)),
                ),
            };
        let result = HealthCheckResult {
            attempt,
            at,
            outcome,
            latency: started.elapsed(),
            raw_status,
            error,
        };
        tracing::debug!(endpoint = %endpoint, attempt, outcome = ?result.outcome, "{}", result.describe());
        result
    }
}
