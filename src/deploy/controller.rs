// ABOUTME: Deploy controller: drives one run from prerequisites to a reported outcome.
// ABOUTME: Owns lock lifetime; every exit path finalizes the outcome and releases the lock once.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::build::ArtifactBuilder;
use crate::diagnostics::{Diagnostics, Warning};
use crate::hooks::{HookContext, HookPoint, HookRunner};
use crate::infra::InfraEngine;
use crate::orchestration::OrchestrationService;
use crate::probe::HealthProbe;
use crate::registry::Registry;
use crate::store::{LockStore, RecordStore};

use super::Deployment;
use super::abort::AbortSignal;
use super::environment::{Environment, EnvironmentRecords};
use super::error::DeployError;
use super::health::HealthVerifier;
use super::infra::InfraAdapter;
use super::lock::LockManager;
use super::publish::ArtifactPublisher;
use super::report::{
    DeploymentOutcome, Journal, OutcomeReporter, RunReport, RunResult, Stage, timed,
};
use super::request::DeploymentRequest;
use super::rollback::{RollbackBudget, RollbackCoordinator};
use super::rollout::RolloutController;
use super::settings::RunSettings;
use super::state::{Locked, OnService};

/// External systems a controller talks to.
pub struct Adapters {
    pub lock_store: Arc<dyn LockStore>,
    pub record_store: Arc<dyn RecordStore>,
    pub builder: Arc<dyn ArtifactBuilder>,
    pub registry: Arc<dyn Registry>,
    pub engine: Arc<dyn InfraEngine>,
    pub orchestrator: Arc<dyn OrchestrationService>,
    pub probe: Arc<dyn HealthProbe>,
}

fn failed(error: DeployError) -> RunResult {
    RunResult::Failed {
        error,
        rollback_failure: None,
    }
}

fn stop<S>(run: Deployment<S>, error: DeployError) -> (Journal, RunResult) {
    tracing::error!(environment = %run.environment(), "deployment stopped: {error}");
    let (_, journal) = run.into_journal();
    (journal, failed(error))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[derive(Debug)]
pub struct DeployController {
    locks: LockManager,
    records: EnvironmentRecords,
    publisher: ArtifactPublisher,
    infra: InfraAdapter,
    rollout: RolloutController,
    health: HealthVerifier,
    rollback: RollbackCoordinator,
    reporter: OutcomeReporter,
    hooks: Option<HookRunner>,
}

impl DeployController {
    pub fn new(adapters: Adapters) -> Self {
        let locks = LockManager::new(adapters.lock_store);
        let records = EnvironmentRecords::new(adapters.record_store, locks.clone());
        let rollout = RolloutController::new(adapters.orchestrator);
        let health = HealthVerifier::new(adapters.probe);
        Self {
            publisher: ArtifactPublisher::new(adapters.builder, adapters.registry),
            infra: InfraAdapter::new(adapters.engine),
            rollback: RollbackCoordinator::new(rollout.clone(), health.clone()),
            reporter: OutcomeReporter::new(records.clone()),
            locks,
            records,
            rollout,
            health,
            hooks: None,
        }
    }

    /// Run lifecycle hooks from `runner`.
    pub fn with_hooks(mut self, runner: HookRunner) -> Self {
        self.hooks = Some(runner);
        self
    }

    pub fn records(&self) -> &EnvironmentRecords {
        &self.records
    }

    /// Drive `request` to exactly one outcome.
    ///
    /// The lock, once acquired, is released exactly once before returning, whatever
    /// happened in between (including panics inside the run).
    pub async fn run(
        &self,
        request: DeploymentRequest,
        settings: RunSettings,
        abort: AbortSignal,
    ) -> DeploymentOutcome {
        let mut diagnostics = Diagnostics::default();
        let mut journal = Journal::default();
        let environment = request.environment().clone();
        tracing::info!(
            environment = %environment,
            version = %request.version(),
            run = %request.run_id(),
            "deployment requested"
        );

        let (checked, took) = timed(self.check_prerequisites(&request)).await;
        journal.record(Stage::Prerequisites, took);
        if let Err(error) = checked {
            return self
                .abandon(request, &settings, journal, error, diagnostics)
                .await;
        }

        let (acquired, took) = timed(self.locks.acquire(
            &environment,
            &settings.holder,
            settings.lock.ttl,
        ))
        .await;
        journal.record(Stage::Lock, took);
        let token = match acquired {
            Ok(token) => token,
            Err(error) => {
                return self
                    .abandon(request, &settings, journal, error, diagnostics)
                    .await;
            }
        };

        let keeper = self
            .locks
            .keep_alive(token, settings.lock.renew_interval, abort.clone());
        let deadline = abort.arm_deadline(settings.timeouts.run);

        let before_run = journal.clone();
        let driven = AssertUnwindSafe(self.drive(&request, &settings, &abort, journal))
            .catch_unwind()
            .await;
        drop(deadline);
        let (token, renewal_warnings) = keeper.stop().await;
        diagnostics.extend(renewal_warnings);

        let (journal, result, record) = match driven {
            Ok(driven) => driven,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(environment = %environment, "run panicked: {message}");
                (before_run, failed(DeployError::Panicked(message)), None)
            }
        };

        let context = HookContext {
            run_id: request.run_id().clone(),
            environment: environment.clone(),
            version: request.version().clone(),
            region: settings.region.clone(),
            previous_version: record
                .as_ref()
                .and_then(|r| r.known_good.as_ref())
                .map(|r| r.version.clone()),
            outcome: None,
            service_url: None,
        };
        let report = RunReport::new(request, settings.region.clone(), journal, result);
        let mut outcome = self
            .reporter
            .finalize(report, record, Some(&token), &mut diagnostics)
            .await;

        let context = HookContext {
            outcome: Some(outcome.status),
            service_url: outcome.service_url.clone(),
            ..context
        };
        if let Some(warning) = self.run_hook(HookPoint::after(outcome.status), &context).await {
            diagnostics.warn(warning.clone());
            outcome.warnings.push(warning);
        }

        if let Err(e) = self.locks.release(&token).await {
            let warning = Warning::lock_release(format!("failed to release lock: {e}"));
            diagnostics.warn(warning.clone());
            outcome.warnings.push(warning);
        }
        outcome
    }

    async fn check_prerequisites(&self, request: &DeploymentRequest) -> Result<(), DeployError> {
        if request.registry().is_none() && !request.skip_build() {
            return Err(DeployError::Prerequisite(
                "a registry is required unless --skip-build is given".to_string(),
            ));
        }
        if !request.skip_infra() {
            self.infra.check_prerequisites().await?;
        }
        self.rollout.check_prerequisites().await
    }

    /// Report a run that ended before the lock was held.
    async fn abandon(
        &self,
        request: DeploymentRequest,
        settings: &RunSettings,
        journal: Journal,
        error: DeployError,
        mut diagnostics: Diagnostics,
    ) -> DeploymentOutcome {
        tracing::error!(environment = %request.environment(), "deployment not started: {error}");
        let report = RunReport::new(request, settings.region.clone(), journal, failed(error));
        self.reporter
            .finalize(report, None, None, &mut diagnostics)
            .await
    }

    async fn drive(
        &self,
        request: &DeploymentRequest,
        settings: &RunSettings,
        abort: &AbortSignal,
        mut journal: Journal,
    ) -> (Journal, RunResult, Option<Environment>) {
        let environment = match self
            .records
            .load(request.environment(), &settings.region)
            .await
        {
            Ok(environment) => environment,
            Err(error) => return (journal, failed(error), None),
        };

        if let Some(hooks) = &self.hooks {
            let context = HookContext {
                run_id: request.run_id().clone(),
                environment: environment.name.clone(),
                version: request.version().clone(),
                region: settings.region.clone(),
                previous_version: environment.known_good.as_ref().map(|r| r.version.clone()),
                outcome: None,
                service_url: None,
            };
            let (ran, took) = timed(hooks.run(HookPoint::PreDeploy, &context)).await;
            if let Some(result) = ran {
                journal.record(Stage::PreDeployHook, took);
                if let Some(reason) = result.failure() {
                    let error = DeployError::Hook(reason.to_string());
                    return (journal, failed(error), Some(environment));
                }
            }
        }

        let mut run = Deployment::new(request.clone(), settings.clone(), abort.clone());
        run.journal = journal;
        let (journal, result) = self.advance(run, &environment).await;
        (journal, result, Some(environment))
    }

    async fn advance(
        &self,
        run: Deployment<Locked>,
        environment: &Environment,
    ) -> (Journal, RunResult) {
        let run = match run.prepare(&self.publisher, &self.infra).await {
            Ok(run) => run,
            Err((run, e)) => return stop(run, e),
        };
        let run = match run.apply(&self.infra, environment.last_apply.as_ref()).await {
            Ok(run) => run,
            Err((run, e)) => return stop(run, e),
        };
        let run = match run.resolve_target() {
            Ok(run) => run,
            Err((run, e)) => return stop(run, e),
        };

        // From here on the running service may have changed.
        let run = match run.rollout(&self.rollout).await {
            Ok(run) => run,
            // Noticed before the update was submitted: the service is untouched.
            Err((run, e @ DeployError::Aborted(_))) => return stop(run, e),
            Err((run, e)) => return self.recover(run, e, environment).await,
        };
        let run = match run.await_convergence(&self.rollout).await {
            Ok(run) => run,
            Err((run, e)) => return self.recover(run, e, environment).await,
        };
        let run = match run.verify(&self.health).await {
            Ok(run) => run,
            Err((run, e)) => return self.recover(run, e, environment).await,
        };
        tracing::info!(
            environment = %run.environment(),
            attempts = run.health_attempts(),
            "release verified healthy"
        );

        let (revision, journal) = run.finish();
        (journal, RunResult::Succeeded(revision))
    }

    /// Route a failure after rollout through the rollback coordinator.
    async fn recover<S: OnService>(
        &self,
        run: Deployment<S>,
        error: DeployError,
        environment: &Environment,
    ) -> (Journal, RunResult) {
        if !error.triggers_rollback() {
            return stop(run, error);
        }
        tracing::warn!(environment = %run.environment(), "{error}; starting rollback");

        let Some(known_good) = environment.known_good.clone() else {
            tracing::error!(environment = %run.environment(), "no known-good revision to restore");
            let (_, journal) = run.into_journal();
            return (
                journal,
                RunResult::Failed {
                    error,
                    rollback_failure: Some(DeployError::NoKnownGood),
                },
            );
        };

        let budget = RollbackBudget {
            timeout: run.settings.timeouts.rollback,
            backoff: run.settings.rollout_backoff,
            health: run.settings.health.clone(),
        };
        let target = run.target().clone();
        let rejected = run.state().artifact().clone();
        let (_, mut journal) = run.into_journal();

        let (rolled_back, took) = timed(self.rollback.rollback(
            &target.service,
            &known_good,
            &target.endpoint,
            &budget,
        ))
        .await;
        journal.record(Stage::Rollback, took);

        let result = match rolled_back {
            Ok(rollback) => RunResult::RolledBack {
                rejected,
                cause: error,
                restored: rollback.restored,
            },
            Err(rollback_error) => RunResult::Failed {
                error,
                rollback_failure: Some(rollback_error),
            },
        };
        (journal, result)
    }

    async fn run_hook(&self, point: HookPoint, context: &HookContext) -> Option<Warning> {
        let result = self.hooks.as_ref()?.run(point, context).await?;
        result.failure().map(Warning::hook)
    }
}
