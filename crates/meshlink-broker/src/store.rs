//! Durable session table
//!
//! The only authoritative record of who is authorized. Every mutation is
//! committed to the state file before the call returns; the kernel-side
//! allow-set is a cache of this table, never the other way around.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use meshlink_common::{
    BrokerError, BrokerResult, ClientAddr, Session, SessionStatus, TerminalReason, TierDef,
};

struct Inner {
    sessions: HashMap<Uuid, Session>,
    /// Live (Pending/Active) session per address; the uniqueness index
    by_addr: HashMap<ClientAddr, Uuid>,
}

/// Durable session store
///
/// In-memory table with write-through JSON persistence (temp file + atomic
/// rename). All mutators persist before returning, so a read after an
/// acknowledged write never observes stale state, and a restart reloads
/// exactly what was acknowledged.
pub struct SessionStore {
    inner: RwLock<Inner>,
    path: PathBuf,
}

impl SessionStore {
    /// Open the store, loading any existing state file
    pub fn open(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let sessions: HashMap<Uuid, Session> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let rows: Vec<Session> = serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            rows.into_iter().map(|s| (s.id, s)).collect()
        } else {
            HashMap::new()
        };

        let by_addr = sessions
            .values()
            .filter(|s| s.status.is_live())
            .map(|s| (s.client_addr, s.id))
            .collect();

        Ok(Self {
            inner: RwLock::new(Inner { sessions, by_addr }),
            path,
        })
    }

    /// Create a Pending session for `addr` under `tier`
    ///
    /// Fails with `Conflict` if the address already has a Pending/Active
    /// session that has not been superseded.
    pub fn create(
        &self,
        addr: ClientAddr,
        mac: Option<String>,
        tier: &TierDef,
    ) -> BrokerResult<Session> {
        let mut inner = self.inner.write();
        if inner.by_addr.contains_key(&addr) {
            return Err(BrokerError::Conflict(addr.to_string()));
        }
        let session = Session::new(addr, mac, tier);
        inner.by_addr.insert(addr, session.id);
        inner.sessions.insert(session.id, session.clone());
        self.persist(&inner)?;
        Ok(session)
    }

    /// Revoke any live session for `addr`, returning its id
    pub fn supersede(&self, addr: ClientAddr) -> BrokerResult<Option<Uuid>> {
        let mut inner = self.inner.write();
        let Some(id) = inner.by_addr.remove(&addr) else {
            return Ok(None);
        };
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.status = SessionStatus::Revoked;
            session.ended_at = Some(Utc::now());
        }
        self.persist(&inner)?;
        Ok(Some(id))
    }

    /// Promote a Pending session to Active after a confirmed grant
    pub fn activate(&self, id: Uuid) -> BrokerResult<Session> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(BrokerError::NotFound(id))?;
        if session.status != SessionStatus::Pending {
            return Err(BrokerError::InvalidState {
                id,
                status: session.status,
            });
        }
        session.status = SessionStatus::Active;
        let session = session.clone();
        self.persist(&inner)?;
        Ok(session)
    }

    /// The live (Pending/Active) session for `addr`, if any
    pub fn get(&self, addr: ClientAddr) -> Option<Session> {
        let inner = self.inner.read();
        let id = inner.by_addr.get(&addr)?;
        inner.sessions.get(id).cloned()
    }

    /// Point read by session id
    pub fn get_by_id(&self, id: Uuid) -> Option<Session> {
        self.inner.read().sessions.get(&id).cloned()
    }

    /// Active sessions ordered by `expires_at` ascending
    pub fn list_active(&self) -> Vec<Session> {
        let inner = self.inner.read();
        let mut active: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.expires_at);
        active
    }

    /// Pending sessions (crash leftovers the reconciler resolves)
    pub fn list_pending(&self) -> Vec<Session> {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending)
            .cloned()
            .collect()
    }

    /// Move a session to a terminal status
    ///
    /// Idempotent: re-marking an already-terminal session is a no-op.
    pub fn mark_terminal(&self, id: Uuid, reason: TerminalReason) -> BrokerResult<()> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(BrokerError::NotFound(id))?;
        if session.status.is_terminal() {
            return Ok(());
        }
        session.status = reason.status();
        session.ended_at = Some(Utc::now());
        let addr = session.client_addr;
        if inner.by_addr.get(&addr) == Some(&id) {
            inner.by_addr.remove(&addr);
        }
        self.persist(&inner)?;
        Ok(())
    }

    /// Attribute `delta` bytes of usage; returns the new total
    pub fn add_usage(&self, id: Uuid, delta: u64) -> BrokerResult<u64> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(BrokerError::NotFound(id))?;
        if session.status != SessionStatus::Active {
            return Err(BrokerError::InvalidState {
                id,
                status: session.status,
            });
        }
        session.data_used_bytes += delta;
        let total = session.data_used_bytes;
        self.persist(&inner)?;
        Ok(total)
    }

    /// Flip terminal rows that ended before `cutoff` to Archived
    ///
    /// Soft deletion only; rows stay in the state file for reporting.
    pub fn archive_terminal(&self, cutoff: DateTime<Utc>) -> BrokerResult<usize> {
        let mut inner = self.inner.write();
        let mut archived = 0;
        for session in inner.sessions.values_mut() {
            if session.status.is_terminal()
                && session.status != SessionStatus::Archived
                && session.ended_at.map_or(false, |t| t < cutoff)
            {
                session.status = SessionStatus::Archived;
                archived += 1;
            }
        }
        if archived > 0 {
            self.persist(&inner)?;
        }
        Ok(archived)
    }

    /// Total rows including archived (reporting)
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, inner: &Inner) -> BrokerResult<()> {
        let rows: Vec<&Session> = inner.sessions.values().collect();
        let content = serde_json::to_string_pretty(&rows)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            // Flush to disk before the rename, or a power cut can leave the
            // final path pointing at a truncated file.
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
