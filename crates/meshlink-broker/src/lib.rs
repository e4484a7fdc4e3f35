//! MeshLink Broker - session authorization core
//!
//! The single source of truth for which client addresses are allowed onto
//! the internet, under which tier, until when, and for how much data.
//!
//! # Architecture
//!
//! ```text
//! portal UI -> Broker::authorize -> SessionStore (create Pending)
//!                                -> EnforcementGateway (grant)
//!                                -> SessionStore (activate)
//!                                -> ExpiryScheduler (arm timer)
//!
//! background: QuotaMeter polls counters -> may revoke early
//!             Reconciler diffs store vs kernel state -> repairs drift
//! ```
//!
//! The kernel allow-set is treated as a derived, reconcilable cache of the
//! set of Active sessions; all coordination goes through the store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod enforce;
pub mod meter;
pub mod nft;
pub mod reconcile;
pub mod scheduler;
pub mod store;

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use meshlink_common::{BrokerError, BrokerResult, ClientAddr, Session, TerminalReason, TierCatalog};

pub use enforce::{EnforcementGateway, MemoryGateway};
pub use meter::QuotaMeter;
pub use nft::NftSetGateway;
pub use reconcile::{ReconcileReport, Reconciler};
pub use scheduler::ExpiryScheduler;
pub use store::SessionStore;

use enforce::{with_retry, DEFAULT_ATTEMPTS};

/// The authorization broker
///
/// The only mutating entry point from outside the core. Writes are
/// serialized per client address with a keyed mutex pool, so two authorize
/// calls for one address, or an authorize racing an expiry, can never leave
/// overlapping grants; unrelated clients proceed independently.
pub struct Broker {
    store: Arc<SessionStore>,
    gateway: Arc<dyn EnforcementGateway>,
    scheduler: Arc<ExpiryScheduler>,
    catalog: TierCatalog,
    addr_locks: DashMap<IpAddr, Arc<Mutex<()>>>,
}

impl Broker {
    /// Wire a broker over its collaborators
    pub fn new(
        store: Arc<SessionStore>,
        gateway: Arc<dyn EnforcementGateway>,
        scheduler: Arc<ExpiryScheduler>,
        catalog: TierCatalog,
    ) -> Self {
        Self {
            store,
            gateway,
            scheduler,
            catalog,
            addr_locks: DashMap::new(),
        }
    }

    fn addr_lock(&self, addr: ClientAddr) -> Arc<Mutex<()>> {
        self.addr_locks
            .entry(addr.ip())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop per-address locks for addresses with no live session.
    ///
    /// Run periodically; without it the lock table grows with every address
    /// ever authorized. A lock still held by an in-flight call (strong count
    /// above the table's own reference) is kept regardless.
    pub fn sweep_addr_locks(&self) {
        self.addr_locks.retain(|ip, lock| {
            Arc::strong_count(lock) > 1 || self.store.get(ClientAddr::from(*ip)).is_some()
        });
    }

    /// Authorize `addr` onto the internet under `tier_name`.
    ///
    /// Supersedes any existing session for the address, commits a Pending
    /// row, grants, then activates and arms the expiry timer. A grant that
    /// cannot be confirmed after retries leaves the row terminal, never
    /// Pending or Active, and surfaces as `EnforcementFailure` - the portal
    /// always gets a definitive answer.
    pub async fn authorize(
        &self,
        addr: ClientAddr,
        mac: Option<String>,
        tier_name: &str,
    ) -> BrokerResult<Session> {
        let tier = self
            .catalog
            .get(tier_name)
            .ok_or_else(|| BrokerError::UnknownTier(tier_name.to_string()))?
            .clone();

        let lock = self.addr_lock(addr);
        let _guard = lock.lock().await;

        // Supersede, never overlap: at most one live session per address
        if let Some(old_id) = self.store.supersede(addr)? {
            self.scheduler.cancel(old_id);
            self.revoke_kernel_side(addr).await;
            tracing::info!(%addr, %old_id, "superseded prior session");
        }

        let pending = self.store.create(addr, mac, &tier)?;

        if let Err(e) = with_retry("grant", DEFAULT_ATTEMPTS, || {
            self.gateway.grant(addr, &tier.name)
        })
        .await
        {
            // Unconfirmed grant: the row must end terminal, not Pending
            if let Err(mark_err) = self.store.mark_terminal(pending.id, TerminalReason::Revoked) {
                tracing::warn!(id = %pending.id, error = %mark_err, "failed-grant cleanup failed");
            }
            return Err(BrokerError::EnforcementFailure(e.to_string()));
        }

        let session = self.store.activate(pending.id)?;
        self.scheduler.arm(&session);

        tracing::info!(
            id = %session.id, %addr, tier = %session.tier,
            expires_at = %session.expires_at, "session authorized"
        );
        Ok(session)
    }

    /// Voluntary early revocation (portal "disconnect").
    ///
    /// Returns the ended session, or None if the address had none.
    pub async fn disconnect(&self, addr: ClientAddr) -> BrokerResult<Option<Session>> {
        let lock = self.addr_lock(addr);
        let _guard = lock.lock().await;

        let Some(session) = self.store.get(addr) else {
            return Ok(None);
        };

        self.scheduler.cancel(session.id);
        self.revoke_kernel_side(addr).await;
        self.store.mark_terminal(session.id, TerminalReason::Revoked)?;

        tracing::info!(id = %session.id, %addr, "session disconnected");
        Ok(self.store.get_by_id(session.id))
    }

    /// Best-effort kernel-side revoke + counter reset.
    ///
    /// A failure here is drift, not an error: the store is authoritative
    /// and the reconciler repairs the allow-set on its next pass.
    async fn revoke_kernel_side(&self, addr: ClientAddr) {
        match with_retry("revoke", DEFAULT_ATTEMPTS, || self.gateway.revoke(addr)).await {
            Ok(()) => {
                if let Err(e) = self.gateway.reset_usage(addr).await {
                    tracing::warn!(%addr, error = %e, "usage counter reset failed");
                }
            }
            Err(e) => tracing::warn!(%addr, error = %e, "revoke failed, reconciler will heal"),
        }
    }

    /// The Active session for `addr`, if any.
    ///
    /// Pending rows are in-flight crash leftovers and are never reported
    /// as connected.
    pub fn session_for(&self, addr: ClientAddr) -> Option<Session> {
        self.store
            .get(addr)
            .filter(|s| s.status == meshlink_common::SessionStatus::Active)
    }

    /// Currently active sessions, soonest expiry first
    pub fn active_sessions(&self) -> Vec<Session> {
        self.store.list_active()
    }

    /// The configured tier catalog
    pub fn tier_catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// The underlying store (reconciler/meter wiring)
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// The underlying gateway (reconciler/meter wiring)
    pub fn gateway(&self) -> Arc<dyn EnforcementGateway> {
        Arc::clone(&self.gateway)
    }

    /// The expiry scheduler (restore and wiring)
    pub fn scheduler(&self) -> Arc<ExpiryScheduler> {
        Arc::clone(&self.scheduler)
    }
}
