// ABOUTME: Generic deployment struct parameterized by state marker.
// ABOUTME: State types carry their own data for compile-time guarantees.

use crate::types::{EnvironmentName, VersionTag};

use super::abort::AbortSignal;
use super::report::Journal;
use super::request::DeploymentRequest;
use super::settings::RunSettings;
use super::state::{Converged, Deploying, Locked, OnService, Target, Verified};

/// A deployment in progress, parameterized by its current state.
///
/// The state type parameter `S` carries state-specific data (the published artifact,
/// the resolved service, the rollout handle) so that each transition can only be
/// called once the data it needs exists.
#[derive(Debug)]
pub struct Deployment<S> {
    pub(crate) request: DeploymentRequest,
    pub(crate) settings: RunSettings,
    pub(crate) abort: AbortSignal,
    pub(crate) journal: Journal,
    pub(crate) state: S,
}

impl Deployment<Locked> {
    /// Start a deployment. The caller must already hold the environment lock.
    pub fn new(request: DeploymentRequest, settings: RunSettings, abort: AbortSignal) -> Self {
        Deployment {
            request,
            settings,
            abort,
            journal: Journal::default(),
            state: Locked,
        }
    }
}

impl<S> Deployment<S> {
    pub fn environment(&self) -> &EnvironmentName {
        self.request.environment()
    }

    pub fn version(&self) -> &VersionTag {
        self.request.version()
    }

    pub fn request(&self) -> &DeploymentRequest {
        &self.request
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Give up on the run, keeping what was recorded so far.
    pub fn into_journal(self) -> (DeploymentRequest, Journal) {
        (self.request, self.journal)
    }
}

impl<S: OnService> Deployment<S> {
    pub fn target(&self) -> &Target {
        self.state.target()
    }
}

impl Deployment<Deploying> {
    /// Backend revision the rollout targets.
    pub fn revision(&self) -> &str {
        &self.state.handle.revision
    }
}

impl Deployment<Converged> {
    pub fn polls(&self) -> u32 {
        self.state.convergence.polls
    }
}

impl Deployment<Verified> {
    pub fn health_attempts(&self) -> u32 {
        self.state.verdict.attempts()
    }
}
