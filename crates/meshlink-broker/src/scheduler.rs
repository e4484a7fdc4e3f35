//! Expiry scheduler
//!
//! One logical timer per Active session, firing at `expires_at`. Timers are
//! tokio tasks; nothing about them is persisted. On process start the whole
//! timer set is re-derived from the durable store, which is what makes a
//! restart recoverable instead of a source of indefinitely-granted access.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

use meshlink_common::{Session, SessionStatus, TerminalReason};

use crate::enforce::{with_retry, EnforcementGateway, DEFAULT_ATTEMPTS};
use crate::store::SessionStore;

/// Per-session expiry timers
pub struct ExpiryScheduler {
    store: Arc<SessionStore>,
    gateway: Arc<dyn EnforcementGateway>,
    timers: DashMap<Uuid, JoinHandle<()>>,
}

impl ExpiryScheduler {
    /// New scheduler with no armed timers
    pub fn new(store: Arc<SessionStore>, gateway: Arc<dyn EnforcementGateway>) -> Self {
        Self {
            store,
            gateway,
            timers: DashMap::new(),
        }
    }

    /// Arm a timer for `session`, replacing any existing timer for its id.
    ///
    /// The task never touches the timer table itself; a zero-delay fire
    /// completing before the handle lands in the table therefore cannot
    /// leave the table inconsistent. Finished entries are ignored by
    /// [`armed_count`](Self::armed_count) and reclaimed by
    /// [`sweep_finished`](Self::sweep_finished).
    pub fn arm(&self, session: &Session) {
        let delay = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        let id = session.id;
        let store = Arc::clone(&self.store);
        let gateway = Arc::clone(&self.gateway);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::fire(&store, &gateway, id).await;
        });

        if let Some(old) = self.timers.insert(id, handle) {
            old.abort();
        }
    }

    /// Arm only if no live timer exists for the session (reconciler repair)
    pub fn ensure_armed(&self, session: &Session) -> bool {
        let live = match self.timers.get(&session.id) {
            Some(handle) => !handle.is_finished(),
            None => false,
        };
        if live {
            return false;
        }
        self.arm(session);
        true
    }

    /// Cancel the timer for `id` if one is armed.
    ///
    /// Must run before a replacement session is armed for the same address,
    /// so a stale timer never revokes the newer session. Racing an
    /// already-started fire is safe: the fire re-checks the session status
    /// and no-ops if it is no longer Active.
    pub fn cancel(&self, id: Uuid) {
        if let Some((_, handle)) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    /// Number of timers that have not yet fired
    pub fn armed_count(&self) -> usize {
        self.timers
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    /// Drop table entries whose timer has already fired.
    ///
    /// Fired tasks leave their handle behind; the reconciler calls this on
    /// each pass so the table tracks the live session population.
    pub fn sweep_finished(&self) {
        self.timers.retain(|_, handle| !handle.is_finished());
    }

    /// Abort every armed timer (daemon shutdown)
    pub fn shutdown(&self) {
        self.timers.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    /// Re-derive the timer set from the durable store at startup.
    ///
    /// Past-due sessions are expired immediately; the rest get timers.
    /// Returns `(expired_now, rearmed)`.
    pub async fn restore(&self) -> (usize, usize) {
        let now = Utc::now();
        let mut expired = 0;
        let mut rearmed = 0;

        for session in self.store.list_active() {
            if session.is_past_due(now) {
                Self::fire(&self.store, &self.gateway, session.id).await;
                expired += 1;
            } else {
                self.arm(&session);
                rearmed += 1;
            }
        }

        tracing::info!(expired, rearmed, "expiry schedule restored");
        (expired, rearmed)
    }

    /// Expire one session: revoke, then mark Expired.
    ///
    /// Both writes are attempted even if one fails; a half-applied expiry
    /// is exactly the drift the reconciler heals, so neither failure is
    /// fatal. The status check is the single authority: a timer that fires
    /// after a supersede finds a non-Active row and does nothing.
    async fn fire(store: &Arc<SessionStore>, gateway: &Arc<dyn EnforcementGateway>, id: Uuid) {
        let Some(session) = store.get_by_id(id) else {
            return;
        };
        if session.status != SessionStatus::Active {
            return;
        }
        let addr = session.client_addr;

        match with_retry("revoke", DEFAULT_ATTEMPTS, || gateway.revoke(addr)).await {
            Ok(()) => {
                if let Err(e) = gateway.reset_usage(addr).await {
                    tracing::warn!(%addr, error = %e, "usage counter reset failed");
                }
            }
            Err(e) => {
                tracing::warn!(%addr, error = %e, "expiry revoke failed, reconciler will heal")
            }
        }

        if let Err(e) = store.mark_terminal(id, TerminalReason::Expired) {
            tracing::warn!(%id, error = %e, "expiry status update failed");
        }

        tracing::info!(%id, %addr, "session expired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::MemoryGateway;
    use meshlink_common::{ClientAddr, TierDef};
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("meshlink-sched-{}.json", Uuid::new_v4()))
    }

    fn tier(secs: u64) -> TierDef {
        TierDef {
            name: "test".into(),
            duration_secs: secs,
            down_kbps: 0,
            up_kbps: 0,
            data_quota_bytes: u64::MAX,
            price_cents: 0,
        }
    }

    async fn granted_active(
        store: &Arc<SessionStore>,
        gw: &Arc<MemoryGateway>,
        ip: &str,
        secs: u64,
    ) -> Session {
        let addr: ClientAddr = ip.parse().unwrap();
        let s = store.create(addr, None, &tier(secs)).unwrap();
        gw.grant(addr, "test").await.unwrap();
        store.activate(s.id).unwrap()
    }

    #[tokio::test]
    async fn test_timer_fires_and_revokes() {
        let store = Arc::new(SessionStore::open(temp_path()).unwrap());
        let gw = Arc::new(MemoryGateway::new());
        let sched = Arc::new(ExpiryScheduler::new(
            store.clone(),
            gw.clone() as Arc<dyn EnforcementGateway>,
        ));

        let s = granted_active(&store, &gw, "10.0.0.5", 1).await;
        sched.arm(&s);

        tokio::time::sleep(Duration::from_millis(1400)).await;

        assert_eq!(
            store.get_by_id(s.id).unwrap().status,
            SessionStatus::Expired
        );
        assert!(gw.list_granted().await.unwrap().is_empty());
        assert_eq!(sched.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let store = Arc::new(SessionStore::open(temp_path()).unwrap());
        let gw = Arc::new(MemoryGateway::new());
        let sched = Arc::new(ExpiryScheduler::new(
            store.clone(),
            gw.clone() as Arc<dyn EnforcementGateway>,
        ));

        let s = granted_active(&store, &gw, "10.0.0.5", 1).await;
        sched.arm(&s);
        sched.cancel(s.id);

        tokio::time::sleep(Duration::from_millis(1400)).await;

        // Timer never fired: the session stayed Active and granted
        assert_eq!(store.get_by_id(s.id).unwrap().status, SessionStatus::Active);
        assert_eq!(gw.list_granted().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fire_is_noop_for_non_active_session() {
        let store = Arc::new(SessionStore::open(temp_path()).unwrap());
        let gw = Arc::new(MemoryGateway::new());

        let s = granted_active(&store, &gw, "10.0.0.5", 1).await;
        store.mark_terminal(s.id, TerminalReason::Revoked).unwrap();

        let gw_dyn: Arc<dyn EnforcementGateway> = gw.clone();
        let before = gw.mutation_count();
        ExpiryScheduler::fire(&store, &gw_dyn, s.id).await;

        // Status authority: an already-terminal session is left alone
        assert_eq!(gw.mutation_count(), before);
        assert_eq!(
            store.get_by_id(s.id).unwrap().status,
            SessionStatus::Revoked
        );
    }

    #[tokio::test]
    async fn test_zero_delay_timer_leaves_no_armed_entry() {
        let store = Arc::new(SessionStore::open(temp_path()).unwrap());
        let gw = Arc::new(MemoryGateway::new());
        let sched = Arc::new(ExpiryScheduler::new(
            store.clone(),
            gw.clone() as Arc<dyn EnforcementGateway>,
        ));

        // Zero-duration tier: the timer can fire before arm() even returns
        let s = granted_active(&store, &gw, "10.0.0.9", 0).await;
        sched.arm(&s);

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            store.get_by_id(s.id).unwrap().status,
            SessionStatus::Expired
        );
        // The fired timer no longer counts as armed, and a repair pass
        // does not re-arm it for the terminal session
        assert_eq!(sched.armed_count(), 0);

        sched.sweep_finished();
        assert_eq!(sched.armed_count(), 0);
        assert!(sched.timers.is_empty());
    }

    #[tokio::test]
    async fn test_restore_expires_past_due_and_rearms_live() {
        let path = temp_path();
        let store = Arc::new(SessionStore::open(&path).unwrap());
        let gw = Arc::new(MemoryGateway::new());

        // A zero-duration tier is past due the moment it is created
        let dead = granted_active(&store, &gw, "10.0.0.1", 0).await;
        let live = granted_active(&store, &gw, "10.0.0.2", 3600).await;

        // Fresh scheduler: simulates a process restart with no timer memory
        let sched = Arc::new(ExpiryScheduler::new(
            store.clone(),
            gw.clone() as Arc<dyn EnforcementGateway>,
        ));
        let (expired, rearmed) = sched.restore().await;

        assert_eq!((expired, rearmed), (1, 1));
        assert_eq!(
            store.get_by_id(dead.id).unwrap().status,
            SessionStatus::Expired
        );
        assert_eq!(
            store.get_by_id(live.id).unwrap().status,
            SessionStatus::Active
        );
        let granted = gw.list_granted().await.unwrap();
        assert!(!granted.contains(&dead.client_addr.ip()));
        assert!(granted.contains(&live.client_addr.ip()));
        assert_eq!(sched.armed_count(), 1);
    }
}
