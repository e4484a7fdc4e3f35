//! Quota meter
//!
//! Polls the gateway's per-address byte counters, attributes deltas to the
//! matching Active session, and cuts a session off when it crosses its
//! tier's data quota. Deltas are keyed by session id, not address, so a
//! counter reset between sessions can never back-charge a new session.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use meshlink_common::{BrokerError, TerminalReason, TierCatalog};

use crate::enforce::{with_retry, EnforcementGateway, DEFAULT_ATTEMPTS};
use crate::scheduler::ExpiryScheduler;
use crate::store::SessionStore;

/// Byte-usage poller and quota enforcer
pub struct QuotaMeter {
    store: Arc<SessionStore>,
    gateway: Arc<dyn EnforcementGateway>,
    scheduler: Arc<ExpiryScheduler>,
    catalog: TierCatalog,
    /// Last counter value observed per session id
    last_seen: DashMap<Uuid, u64>,
}

impl QuotaMeter {
    /// New meter over the given store, gateway, and scheduler
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
            last_seen: DashMap::new(),
        }
    }

    /// One polling pass; returns the number of sessions cut off for quota
    pub async fn poll_once(&self) -> usize {
        let active = self.store.list_active();
        let mut cut_off = 0;

        for session in &active {
            let addr = session.client_addr;
            let counter = match self.gateway.read_usage_bytes(addr).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "usage read failed");
                    continue;
                }
            };

            let last = self.last_seen.insert(session.id, counter).unwrap_or(0);
            // A counter behind our last observation means it was reset
            // under us; charge nothing rather than a bogus delta.
            let delta = counter.saturating_sub(last);

            let total = if delta > 0 {
                match self.store.add_usage(session.id, delta) {
                    Ok(total) => total,
                    Err(BrokerError::InvalidState { .. }) | Err(BrokerError::NotFound(_)) => {
                        // Expired or superseded since the snapshot
                        self.last_seen.remove(&session.id);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(id = %session.id, error = %e, "usage write failed");
                        continue;
                    }
                }
            } else {
                session.data_used_bytes
            };

            let Some(tier) = self.catalog.get(&session.tier) else {
                tracing::warn!(id = %session.id, tier = %session.tier, "session tier missing from catalog");
                continue;
            };

            if total >= tier.data_quota_bytes {
                self.cut_off(session.id, addr, total, tier.data_quota_bytes).await;
                cut_off += 1;
            }
        }

        // Drop tracking for sessions that are no longer active
        self.last_seen
            .retain(|id, _| active.iter().any(|s| s.id == *id));

        cut_off
    }

    /// Quota exhausted: revoke, reset the counter, mark QuotaExceeded.
    ///
    /// Same dual-write discipline as expiry: both writes are attempted,
    /// failures are logged, the reconciler heals any half-applied result.
    async fn cut_off(&self, id: Uuid, addr: meshlink_common::ClientAddr, used: u64, quota: u64) {
        self.scheduler.cancel(id);

        match with_retry("revoke", DEFAULT_ATTEMPTS, || self.gateway.revoke(addr)).await {
            Ok(()) => {
                if let Err(e) = self.gateway.reset_usage(addr).await {
                    tracing::warn!(%addr, error = %e, "usage counter reset failed");
                }
            }
            Err(e) => tracing::warn!(%addr, error = %e, "quota revoke failed, reconciler will heal"),
        }

        if let Err(e) = self.store.mark_terminal(id, TerminalReason::QuotaExceeded) {
            tracing::warn!(%id, error = %e, "quota status update failed");
        }
        self.last_seen.remove(&id);

        tracing::info!(%id, %addr, used, quota, "session cut off: quota exceeded");
    }

    /// Fixed-cadence polling loop
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::MemoryGateway;
    use meshlink_common::{ClientAddr, SessionStatus, TierDef};
    use std::path::PathBuf;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("meshlink-meter-{}.json", Uuid::new_v4()))
    }

    fn catalog_with_quota(quota: u64) -> TierCatalog {
        TierCatalog::new(vec![TierDef {
            name: "metered".into(),
            duration_secs: 3600,
            down_kbps: 1000,
            up_kbps: 512,
            data_quota_bytes: quota,
            price_cents: 0,
        }])
    }

    struct Rig {
        store: Arc<SessionStore>,
        gw: Arc<MemoryGateway>,
        meter: QuotaMeter,
    }

    fn rig(quota: u64) -> Rig {
        let store = Arc::new(SessionStore::open(temp_path()).unwrap());
        let gw = Arc::new(MemoryGateway::new());
        let gw_dyn: Arc<dyn EnforcementGateway> = gw.clone();
        let sched = Arc::new(ExpiryScheduler::new(store.clone(), gw_dyn.clone()));
        let meter = QuotaMeter::new(store.clone(), gw_dyn, sched, catalog_with_quota(quota));
        Rig { store, gw, meter }
    }

    async fn metered_session(r: &Rig, ip: &str) -> meshlink_common::Session {
        let addr: ClientAddr = ip.parse().unwrap();
        let tier = r.meter.catalog.get("metered").unwrap().clone();
        let s = r.store.create(addr, None, &tier).unwrap();
        r.gw.grant(addr, "metered").await.unwrap();
        r.store.activate(s.id).unwrap()
    }

    #[tokio::test]
    async fn test_usage_attributed_below_quota() {
        let r = rig(10_000);
        let s = metered_session(&r, "10.0.0.5").await;

        r.gw.record_traffic(s.client_addr, 3_000);
        assert_eq!(r.meter.poll_once().await, 0);
        assert_eq!(r.store.get_by_id(s.id).unwrap().data_used_bytes, 3_000);

        // Second poll only charges the delta
        r.gw.record_traffic(s.client_addr, 2_000);
        assert_eq!(r.meter.poll_once().await, 0);
        assert_eq!(r.store.get_by_id(s.id).unwrap().data_used_bytes, 5_000);
        assert_eq!(r.store.get_by_id(s.id).unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_quota_exceeded_revokes() {
        let r = rig(10_000);
        let s = metered_session(&r, "10.0.0.5").await;

        r.gw.record_traffic(s.client_addr, 12_000);
        assert_eq!(r.meter.poll_once().await, 1);

        let after = r.store.get_by_id(s.id).unwrap();
        assert_eq!(after.status, SessionStatus::QuotaExceeded);
        assert_eq!(after.data_used_bytes, 12_000);
        assert!(!r.gw.list_granted().await.unwrap().contains(&s.client_addr.ip()));
        // Counter was reset for the next session on this address
        assert_eq!(r.gw.read_usage_bytes(s.client_addr).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counter_reset_never_back_charges() {
        let r = rig(10_000);
        let s = metered_session(&r, "10.0.0.5").await;

        r.gw.record_traffic(s.client_addr, 4_000);
        r.meter.poll_once().await;

        // Counter reset out from under the meter (e.g. kernel set flushed)
        r.gw.reset_usage(s.client_addr).await.unwrap();
        r.gw.record_traffic(s.client_addr, 1_000);
        r.meter.poll_once().await;

        // The post-reset observation re-baselines; nothing is back-charged
        assert_eq!(r.store.get_by_id(s.id).unwrap().data_used_bytes, 4_000);

        // Traffic after the new baseline is charged normally
        r.gw.record_traffic(s.client_addr, 1_000);
        r.meter.poll_once().await;
        assert_eq!(r.store.get_by_id(s.id).unwrap().data_used_bytes, 5_000);
    }

    #[tokio::test]
    async fn test_exact_quota_boundary_cuts_off() {
        let r = rig(10_000);
        let s = metered_session(&r, "10.0.0.5").await;

        // Reaching the quota exactly counts as exhausted
        r.gw.record_traffic(s.client_addr, 10_000);
        assert_eq!(r.meter.poll_once().await, 1);
        assert_eq!(
            r.store.get_by_id(s.id).unwrap().status,
            SessionStatus::QuotaExceeded
        );
    }
}
