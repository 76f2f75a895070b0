// ABOUTME: Per-environment deploy lock backed by a conditional-write lock store.
// ABOUTME: Tokens carry a unique lease id so only the holder can renew or release them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::Warning;
use crate::store::LockStore;
use crate::types::{EnvironmentName, LeaseId};

use super::abort::AbortSignal;
use super::error::{AbortReason, DeployError};

static LEASE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Contention reads retried when the competing lease vanishes between put and read.
const ACQUIRE_ATTEMPTS: u32 = 3;

/// Information about who holds a deploy lock. Stored as the lock value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockClaim {
    /// Operator or CI identity that requested the run.
    pub holder: String,
    /// Hostname of the machine that holds the lock.
    pub host: String,
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Unique per acquisition.
    pub lease: LeaseId,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LockClaim {
    /// Create a claim for the current process.
    pub fn new(holder: &str) -> Self {
        let acquired_at = Utc::now();
        let pid = std::process::id();
        let n = LEASE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            holder: holder.to_string(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            pid,
            lease: LeaseId::new(format!(
                "{pid}-{}-{n}",
                acquired_at.timestamp_nanos_opt().unwrap_or_default()
            )),
            acquired_at,
        }
    }

    /// Human-readable holder for contention messages.
    pub fn describe(&self) -> String {
        format!("{} on {} (pid {})", self.holder, self.host, self.pid)
    }
}

/// Proof of holding the lock for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    environment: EnvironmentName,
    claim: LockClaim,
    value: String,
    ttl: Duration,
    expires_at: DateTime<Utc>,
}

impl LockToken {
    pub fn environment(&self) -> &EnvironmentName {
        &self.environment
    }

    pub fn claim(&self) -> &LockClaim {
        &self.claim
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry as of the last successful acquire or renew.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn refreshed(&self) -> Self {
        Self {
            expires_at: expiry(self.ttl),
            ..self.clone()
        }
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub(crate) fn lock_key(environment: &EnvironmentName) -> String {
    format!("locks/{environment}")
}

/// Acquires, renews, and releases environment locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Acquire the lock for `environment`.
    ///
    /// Fails immediately with `LockContention` if another live token exists; retrying is
    /// the caller's decision.
    pub async fn acquire(
        &self,
        environment: &EnvironmentName,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockToken, DeployError> {
        let key = lock_key(environment);
        let claim = LockClaim::new(holder);
        let value = serde_json::to_string(&claim)
            .map_err(|e| DeployError::Config(format!("failed to serialize lock claim: {e}")))?;

        for _ in 0..ACQUIRE_ATTEMPTS {
            if self.store.conditional_put(&key, &value, ttl).await? {
                tracing::info!(environment = %environment, lease = %claim.lease, "lock acquired");
                return Ok(LockToken {
                    environment: environment.clone(),
                    claim,
                    value,
                    ttl,
                    expires_at: expiry(ttl),
                });
            }

            if let Some(lease) = self.store.read(&key).await? {
                let holder = serde_json::from_str::<LockClaim>(&lease.value)
                    .map(|c| c.describe())
                    .unwrap_or_else(|_| "an unknown holder".to_string());
                return Err(DeployError::LockContention {
                    environment: environment.clone(),
                    holder,
                    remaining: lease.remaining,
                });
            }
            tracing::debug!(environment = %environment, "competing lease vanished, retrying");
        }

        Err(DeployError::LockContention {
            environment: environment.clone(),
            holder: "a competing controller".to_string(),
            remaining: Duration::ZERO,
        })
    }

    /// Extend the token's lease by its TTL.
    pub async fn renew(&self, token: &LockToken) -> Result<LockToken, DeployError> {
        let key = lock_key(&token.environment);
        if self.store.refresh(&key, &token.value, token.ttl).await? {
            let renewed = token.refreshed();
            tracing::debug!(
                environment = %token.environment,
                expires_at = %renewed.expires_at(),
                "lock renewed"
            );
            Ok(renewed)
        } else {
            Err(DeployError::LockExpired {
                environment: token.environment.clone(),
            })
        }
    }

    /// Whether the token still holds a live lease.
    pub async fn verify(&self, token: &LockToken) -> Result<(), DeployError> {
        let key = lock_key(&token.environment);
        match self.store.read(&key).await? {
            Some(lease) if lease.value == token.value => Ok(()),
            _ => Err(DeployError::LockExpired {
                environment: token.environment.clone(),
            }),
        }
    }

    /// Release the lock. Releasing an expired or already released token is not an error.
    pub async fn release(&self, token: &LockToken) -> Result<(), DeployError> {
        let key = lock_key(&token.environment);
        self.store.delete(&key, &token.value).await?;
        tracing::info!(environment = %token.environment, "lock released");
        Ok(())
    }

    /// Current holder of the lock for `environment` and the time left on its lease.
    pub async fn holder(
        &self,
        environment: &EnvironmentName,
    ) -> Result<Option<(LockClaim, Duration)>, DeployError> {
        let Some(lease) = self.store.read(&lock_key(environment)).await? else {
            return Ok(None);
        };
        let claim = serde_json::from_str(&lease.value).map_err(|e| {
            DeployError::Config(format!("unreadable lock claim for {environment}: {e}"))
        })?;
        Ok(Some((claim, lease.remaining)))
    }

    /// Renew `token` every `every` until stopped.
    ///
    /// Losing the lease triggers `AbortReason::LockLost` on `abort`. Store errors are
    /// tolerated (and reported as warnings) while the last renewal is still within its TTL.
    pub fn keep_alive(&self, token: LockToken, every: Duration, abort: AbortSignal) -> LeaseKeeper {
        let current = Arc::new(Mutex::new(token));
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();

        let task = {
            let manager = self.clone();
            let current = Arc::clone(&current);
            let warnings = Arc::clone(&warnings);
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut valid_until = tokio::time::Instant::now() + current.lock().ttl;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(every) => {}
                    }

                    let token = current.lock().clone();
                    match manager.renew(&token).await {
                        Ok(renewed) => {
                            valid_until = tokio::time::Instant::now() + renewed.ttl;
                            *current.lock() = renewed;
                        }
                        Err(DeployError::LockExpired { .. }) => {
                            tracing::error!(environment = %token.environment, "lock lost");
                            abort.trigger(AbortReason::LockLost);
                            return;
                        }
                        Err(e) => {
                            let warning =
                                Warning::lock_renewal(format!("lock renewal failed: {e}"));
                            tracing::warn!("{}", warning.message);
                            warnings.lock().push(warning);
                            if tokio::time::Instant::now() >= valid_until {
                                abort.trigger(AbortReason::LockLost);
                                return;
                            }
                        }
                    }
                }
            })
        };

        LeaseKeeper {
            current,
            warnings,
            stop,
            task,
        }
    }
}

/// Background renewal of one token.
#[derive(Debug)]
pub struct LeaseKeeper {
    current: Arc<Mutex<LockToken>>,
    warnings: Arc<Mutex<Vec<Warning>>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaseKeeper {
    /// Latest token (expiry updated by renewals).
    pub fn token(&self) -> LockToken {
        self.current.lock().clone()
    }

    /// Stop renewing and hand back the latest token plus any renewal warnings.
    pub async fn stop(self) -> (LockToken, Vec<Warning>) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("lease keeper task failed: {e}");
        }
        let token = self.current.lock().clone();
        let warnings = std::mem::take(&mut *self.warnings.lock());
        (token, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn env(name: &str) -> EnvironmentName {
        EnvironmentName::new(name).unwrap()
    }

    #[test]
    fn claim_creates_with_current_host_and_pid() {
        let claim = LockClaim::new("ci");
        assert_eq!(claim.pid, std::process::id());
        assert!(!claim.host.is_empty());
        assert_ne!(claim.lease, LockClaim::new("ci").lease);
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_reports_contention() {
        let locks = LockManager::new(Arc::new(MemoryStore::new()));
        let ttl = Duration::from_secs(60);

        let _token = locks.acquire(&env("dev"), "alice", ttl).await.unwrap();
        let err = locks.acquire(&env("dev"), "bob", ttl).await.unwrap_err();

        match err {
            DeployError::LockContention {
                holder, remaining, ..
            } => {
                assert!(holder.starts_with("alice on "));
                assert_eq!(remaining, ttl);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn environments_are_independent() {
        let locks = LockManager::new(Arc::new(MemoryStore::new()));
        let ttl = Duration::from_secs(60);
        locks.acquire(&env("dev"), "a", ttl).await.unwrap();
        locks.acquire(&env("prod"), "b", ttl).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn holder_reports_live_claim_only() {
        let locks = LockManager::new(Arc::new(MemoryStore::new()));
        let ttl = Duration::from_secs(60);
        assert!(locks.holder(&env("dev")).await.unwrap().is_none());

        let token = locks.acquire(&env("dev"), "alice", ttl).await.unwrap();
        let (claim, remaining) = locks.holder(&env("dev")).await.unwrap().unwrap();
        assert_eq!(&claim, token.claim());
        assert_eq!(remaining, ttl);

        locks.release(&token).await.unwrap();
        assert!(locks.holder(&env("dev")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_fails_after_expiry() {
        let locks = LockManager::new(Arc::new(MemoryStore::new()));
        let token = locks
            .acquire(&env("dev"), "a", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(locks.renew(&token).await.is_ok());
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(matches!(
            locks.renew(&token).await,
            Err(DeployError::LockExpired { .. })
        ));
        assert!(locks.verify(&token).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_idempotent_and_frees_the_lock() {
        let locks = LockManager::new(Arc::new(MemoryStore::new()));
        let ttl = Duration::from_secs(60);
        let token = locks.acquire(&env("dev"), "a", ttl).await.unwrap();

        locks.release(&token).await.unwrap();
        locks.release(&token).await.unwrap();

        locks.acquire(&env("dev"), "b", ttl).await.unwrap();
        // Stale token cannot release the new holder's lock.
        locks.release(&token).await.unwrap();
        assert!(locks.acquire(&env("dev"), "c", ttl).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn keeper_renews_past_the_original_ttl() {
        let locks = LockManager::new(Arc::new(MemoryStore::new()));
        let ttl = Duration::from_secs(30);
        let token = locks.acquire(&env("dev"), "a", ttl).await.unwrap();
        let abort = AbortSignal::new();

        let keeper = locks.keep_alive(token, Duration::from_secs(10), abort.clone());
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert!(!abort.is_triggered());
        let (token, warnings) = keeper.stop().await;
        assert!(warnings.is_empty());
        locks.verify(&token).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keeper_aborts_when_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone());
        let ttl = Duration::from_secs(30);
        let token = locks.acquire(&env("dev"), "a", ttl).await.unwrap();
        let abort = AbortSignal::new();
        let keeper = locks.keep_alive(token.clone(), Duration::from_secs(10), abort.clone());

        // Another process deletes and re-takes the lease.
        store.delete("locks/dev", &token.value).await.unwrap();
        store
            .conditional_put("locks/dev", "intruder", ttl)
            .await
            .unwrap();

        assert_eq!(abort.aborted().await, AbortReason::LockLost);
        keeper.stop().await;
    }
}
