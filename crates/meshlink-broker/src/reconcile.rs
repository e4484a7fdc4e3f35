//! Store/gateway reconciliation
//!
//! The kernel allow-set is mutable, crash-prone state. Drift between it and
//! the session store is not an error condition here: it is this module's
//! routine job. A pass runs once at startup, before the authorization API
//! serves requests, and on a fixed interval thereafter, and is idempotent.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use meshlink_common::{BrokerResult, SessionStatus, TerminalReason};

use crate::enforce::{with_retry, EnforcementGateway, DEFAULT_ATTEMPTS};
use crate::scheduler::ExpiryScheduler;
use crate::store::SessionStore;

/// What a reconciliation pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale grants revoked (`actual \ desired`)
    pub revoked: usize,
    /// Missing grants repaired (`desired \ actual`)
    pub granted: usize,
    /// Pending rows resolved (activated or revoked)
    pub pending_resolved: usize,
    /// Expiry timers found missing and re-armed
    pub timers_armed: usize,
    /// Terminal rows archived
    pub archived: usize,
}

impl ReconcileReport {
    /// Whether the pass changed anything
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic store/gateway reconciler
pub struct Reconciler {
    store: Arc<SessionStore>,
    gateway: Arc<dyn EnforcementGateway>,
    scheduler: Arc<ExpiryScheduler>,
    /// Terminal rows older than this are archived
    archive_after: chrono::Duration,
    /// Pending rows younger than this are presumed in-flight, not crashed
    pending_grace: chrono::Duration,
}

impl Reconciler {
    /// New reconciler over the given store, gateway, and scheduler
    pub fn new(
        store: Arc<SessionStore>,
        gateway: Arc<dyn EnforcementGateway>,
        scheduler: Arc<ExpiryScheduler>,
        archive_after: chrono::Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            scheduler,
            archive_after,
            pending_grace: chrono::Duration::seconds(10),
        }
    }

    /// Override the grace window for Pending rows (tests, fast hardware)
    pub fn with_pending_grace(mut self, grace: chrono::Duration) -> Self {
        self.pending_grace = grace;
        self
    }

    /// One reconciliation pass
    pub async fn run_once(&self) -> BrokerResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.resolve_pending(&mut report).await;

        // Snapshot both sides; per-address operations may race us, so every
        // repair re-checks the row's status right before mutating.
        let desired: HashMap<IpAddr, String> = self
            .store
            .list_active()
            .into_iter()
            .map(|s| (s.client_addr.ip(), s.tier))
            .collect();
        let actual = match self.gateway.list_granted().await {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(error = %e, "reconcile: allow-set read failed, skipping pass");
                return Ok(report);
            }
        };

        // Stale grants: allow-listed addresses with no Active session.
        // This closes the "stale grant survives restart" gap.
        for ip in actual.iter().filter(|ip| !desired.contains_key(*ip)) {
            let addr = (*ip).into();
            // Re-check: a live row that is not in the Active snapshot is an
            // authorize call mid-grant (Pending) or one that activated after
            // the snapshot; revoking here would undo its grant.
            if self.store.get(addr).is_some() {
                continue;
            }
            match with_retry("revoke", DEFAULT_ATTEMPTS, || self.gateway.revoke(addr)).await {
                Ok(()) => {
                    let _ = self.gateway.reset_usage(addr).await;
                    tracing::info!(%addr, "reconcile: revoked stale grant");
                    report.revoked += 1;
                }
                Err(e) => tracing::warn!(%addr, error = %e, "reconcile: stale revoke failed"),
            }
        }

        // Missing grants: Active sessions the kernel never heard about
        // (a crash between the store commit and the grant).
        for (ip, tier) in desired.iter().filter(|(ip, _)| !actual.contains(*ip)) {
            let addr = (*ip).into();
            // Re-check: the session may have expired since the snapshot
            let still_active = self
                .store
                .get(addr)
                .map_or(false, |s| s.status == SessionStatus::Active);
            if !still_active {
                continue;
            }
            match with_retry("grant", DEFAULT_ATTEMPTS, || self.gateway.grant(addr, tier)).await {
                Ok(()) => {
                    tracing::info!(%addr, %tier, "reconcile: repaired missing grant");
                    report.granted += 1;
                }
                Err(e) => tracing::warn!(%addr, error = %e, "reconcile: grant repair failed"),
            }
        }

        // Timers can be lost independently of the store (scheduler restart);
        // drop fired handles, then re-derive any that are missing.
        self.scheduler.sweep_finished();
        for session in self.store.list_active() {
            if self.scheduler.ensure_armed(&session) {
                report.timers_armed += 1;
            }
        }

        report.archived = self
            .store
            .archive_terminal(Utc::now() - self.archive_after)?;

        if !report.is_noop() {
            tracing::info!(?report, "reconcile pass complete");
        }
        Ok(report)
    }

    /// Resolve Pending rows left by a crash between create and grant.
    ///
    /// The grant is retried; if it cannot be confirmed the row is revoked.
    /// Either way no row stays Pending past a reconciler pass.
    async fn resolve_pending(&self, report: &mut ReconcileReport) {
        let now = Utc::now();
        for session in self.store.list_pending() {
            // A young Pending row is likely an authorize call mid-flight,
            // not a crash leftover; leave it for the next pass.
            if now - session.created_at < self.pending_grace {
                continue;
            }
            let addr = session.client_addr;
            let tier = session.tier.clone();
            let outcome =
                with_retry("grant", DEFAULT_ATTEMPTS, || self.gateway.grant(addr, &tier)).await;
            match outcome {
                Ok(()) => match self.store.activate(session.id) {
                    Ok(activated) => {
                        self.scheduler.arm(&activated);
                        tracing::info!(id = %session.id, %addr, "reconcile: pending row activated");
                        report.pending_resolved += 1;
                    }
                    Err(e) => {
                        tracing::warn!(id = %session.id, error = %e, "reconcile: activate failed")
                    }
                },
                Err(e) => {
                    tracing::warn!(id = %session.id, %addr, error = %e, "reconcile: pending grant failed, revoking row");
                    let _ = with_retry("revoke", DEFAULT_ATTEMPTS, || self.gateway.revoke(addr)).await;
                    if let Err(e) = self.store.mark_terminal(session.id, TerminalReason::Revoked) {
                        tracing::warn!(id = %session.id, error = %e, "reconcile: pending revoke failed");
                    }
                    report.pending_resolved += 1;
                }
            }
        }
    }

    /// Interval reconciliation loop
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup pass already ran
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                tracing::warn!(error = %e, "reconcile pass failed");
            }
        }
    }
}
