// ABOUTME: Opaque string identifiers tagged with the kind of thing they name.
// ABOUTME: Runs, services, diffs, infrastructure snapshots, and lock leases each get their own type.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

// Uninhabited tags; they only exist at the type level.
pub enum RunMarker {}
pub enum ServiceMarker {}
pub enum DiffMarker {}
pub enum SnapshotMarker {}
pub enum LeaseMarker {}

/// String handed out by an external system (or by us), tagged with what it names.
///
/// A `ServiceId` can't be passed where a `SnapshotId` is expected.
#[must_use]
pub struct Id<T> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_inner(self) -> String {
        self.value
    }
}

// Written out by hand so that no bounds land on the tag type.

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Id<T> {
    fn eq(&self, rhs: &Self) -> bool {
        self.value == rhs.value
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.value.hash(hasher);
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Identifies one controller run.
pub type RunId = Id<RunMarker>;
/// Identifies a service inside the orchestration service.
pub type ServiceId = Id<ServiceMarker>;
/// Identifies one computed infrastructure diff.
pub type DiffId = Id<DiffMarker>;
/// Infrastructure state generation token (snapshot of the declarative state).
pub type SnapshotId = Id<SnapshotMarker>;
/// Unique value written into the lock store for one lease.
pub type LeaseId = Id<LeaseMarker>;

impl RunId {
    /// Generate a run id from the current time and process.
    pub fn generate() -> Self {
        let now = chrono::Utc::now();
        Self::new(format!(
            "run-{}-{}",
            now.format("%Y%m%dT%H%M%S%.3fZ"),
            std::process::id()
        ))
    }
}
