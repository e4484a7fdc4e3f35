//! Enforcement gateway
//!
//! The seam between the broker and the kernel packet filter. The broker
//! treats the allow-set as a capability with four primitives plus a counter
//! reset; the set itself is a derived cache of the session store, repaired
//! by the reconciler whenever the two diverge.

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use meshlink_common::ClientAddr;

/// Enforcement-layer failure
#[derive(Error, Debug, Clone)]
pub enum EnforceError {
    /// The underlying set mutation or read failed
    #[error("enforcement backend: {0}")]
    Backend(String),
}

/// Kernel allow-set capability
///
/// All operations are idempotent: granting a present address and revoking
/// an absent one are successes, not errors.
#[async_trait]
pub trait EnforcementGateway: Send + Sync {
    /// Add `addr` to the global allow-set and the tier-named set
    async fn grant(&self, addr: ClientAddr, tier: &str) -> Result<(), EnforceError>;

    /// Remove `addr` from all sets
    async fn revoke(&self, addr: ClientAddr) -> Result<(), EnforceError>;

    /// Ground-truth read of the currently allow-listed addresses
    async fn list_granted(&self) -> Result<HashSet<IpAddr>, EnforceError>;

    /// Cumulative bytes for `addr` since the last reset
    async fn read_usage_bytes(&self, addr: ClientAddr) -> Result<u64, EnforceError>;

    /// Zero the byte counter for `addr` (called on every revocation path)
    async fn reset_usage(&self, addr: ClientAddr) -> Result<(), EnforceError>;
}

/// Default attempts for gateway primitives
pub const DEFAULT_ATTEMPTS: u32 = 3;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Retry a gateway primitive with bounded backoff.
///
/// Transient failures that eventually succeed are logged at warn and never
/// surfaced to the caller. The returned error is the last attempt's.
pub async fn with_retry<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> Result<T, EnforceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EnforceError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut last = EnforceError::Backend("no attempts made".into());
    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::warn!(%what, attempt, error = %e, "enforcement call failed");
                last = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
    Err(last)
}

/// In-process gateway
///
/// Backs tests and dry-run deployments. Tracks mutation counts (so
/// reconciler idempotence is observable) and supports injecting a burst of
/// failures to exercise the retry and failure paths.
pub struct MemoryGateway {
    /// addr -> tier set the address is a member of
    allowed: DashMap<IpAddr, String>,
    counters: DashMap<IpAddr, u64>,
    mutations: AtomicU64,
    fail_next: AtomicU32,
}

impl MemoryGateway {
    /// Empty gateway
    pub fn new() -> Self {
        Self {
            allowed: DashMap::new(),
            counters: DashMap::new(),
            mutations: AtomicU64::new(0),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Simulate forwarded traffic for `addr`
    pub fn record_traffic(&self, addr: ClientAddr, bytes: u64) {
        *self.counters.entry(addr.ip()).or_insert(0) += bytes;
    }

    /// Fail the next `n` grant/revoke calls with a transient error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of grant/revoke mutations performed so far
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Tier set an address is currently a member of
    pub fn tier_of(&self, addr: ClientAddr) -> Option<String> {
        self.allowed.get(&addr.ip()).map(|t| t.clone())
    }

    fn maybe_fail(&self) -> Result<(), EnforceError> {
        let prev = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match prev {
            Ok(_) => Err(EnforceError::Backend("resource busy".into())),
            Err(_) => Ok(()),
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnforcementGateway for MemoryGateway {
    async fn grant(&self, addr: ClientAddr, tier: &str) -> Result<(), EnforceError> {
        self.maybe_fail()?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.allowed.insert(addr.ip(), tier.to_string());
        Ok(())
    }

    async fn revoke(&self, addr: ClientAddr) -> Result<(), EnforceError> {
        self.maybe_fail()?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.allowed.remove(&addr.ip());
        Ok(())
    }

    async fn list_granted(&self) -> Result<HashSet<IpAddr>, EnforceError> {
        Ok(self.allowed.iter().map(|e| *e.key()).collect())
    }

    async fn read_usage_bytes(&self, addr: ClientAddr) -> Result<u64, EnforceError> {
        Ok(self.counters.get(&addr.ip()).map(|c| *c).unwrap_or(0))
    }

    async fn reset_usage(&self, addr: ClientAddr) -> Result<(), EnforceError> {
        self.counters.insert(addr.ip(), 0);
        Ok(())
    }
}
