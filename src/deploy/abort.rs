// ABOUTME: Run-wide abort signal shared by polling loops, the lease keeper, and the deadline timer.
// ABOUTME: The first recorded reason wins; later triggers are ignored.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::AbortReason;

/// Cloneable handle that interrupts a run.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the run. Only the first reason is kept.
    pub fn trigger(&self, reason: AbortReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        tracing::warn!(%reason, "aborting run");
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.reason.lock()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Aborted)` if the run has been aborted.
    pub fn check(&self) -> Result<(), super::DeployError> {
        match self.reason() {
            Some(reason) => Err(super::DeployError::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Resolves with the reason once the run is aborted.
    pub async fn aborted(&self) -> AbortReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(AbortReason::Cancelled)
    }

    /// Trigger `Deadline` after `after`, unless the run finished first.
    /// The returned guard cancels the timer when dropped.
    pub fn arm_deadline(&self, after: Duration) -> DeadlineGuard {
        let stop = CancellationToken::new();
        let signal = self.clone();
        let guard = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => signal.trigger(AbortReason::Deadline),
                _ = stop.cancelled() => {}
            }
        });
        DeadlineGuard {
            _stop: guard.drop_guard(),
        }
    }
}

/// Disarms the deadline timer when dropped.
#[derive(Debug)]
pub struct DeadlineGuard {
    _stop: tokio_util::sync::DropGuard,
}
