// ABOUTME: Non-fatal problems noticed during a run, kept for the final outcome.
// ABOUTME: A warning never changes the status of a run; it only has to reach the operator.

use serde::{Deserialize, Serialize};

/// Warnings gathered over one run, in the order they happened.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Log `warning` and keep it.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!(kind = ?warning.kind, "{}", warning.message);
        self.warnings.push(warning);
    }

    /// Keep warnings that were logged where they were raised.
    pub fn extend(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        self.warnings.extend(warnings);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn lock_release(message: impl Into<String>) -> Self {
        Self::new(WarningKind::LockRelease, message)
    }

    /// A renewal failed while the lease still had time left.
    pub fn lock_renewal(message: impl Into<String>) -> Self {
        Self::new(WarningKind::LockRenewal, message)
    }

    pub fn hook(message: impl Into<String>) -> Self {
        Self::new(WarningKind::Hook, message)
    }

    pub fn record(message: impl Into<String>) -> Self {
        Self::new(WarningKind::Record, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// The lock could not be released; it expires at the end of its TTL.
    LockRelease,
    LockRenewal,
    /// A post-deploy or on-error hook failed.
    Hook,
    /// Known-good pointer, rejection, or outcome could not be persisted.
    Record,
}
