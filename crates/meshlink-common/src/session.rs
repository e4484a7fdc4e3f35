//! Session lifecycle model
//!
//! A session is the broker's record of one grant of internet access to one
//! client address under one tier. The kernel allow-set is a projection of
//! the set of Active sessions; everything else here exists to keep that
//! projection honest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::addr::ClientAddr;
use crate::tier::TierDef;

/// Session status
///
/// `Pending -> Active -> {Expired | Revoked | QuotaExceeded} -> Archived`.
/// A Pending row exists only between the durable create and the kernel-side
/// grant; it is never reported to the portal as "connected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Committed to the store, kernel grant not yet confirmed
    Pending,
    /// Granted and inside its tier window
    Active,
    /// Tier duration elapsed
    Expired,
    /// Terminated early: superseded, disconnected, or grant failed
    Revoked,
    /// Data quota exhausted before the tier window closed
    QuotaExceeded,
    /// Terminal row past its reporting-retention window
    Archived,
}

impl SessionStatus {
    /// Terminal statuses imply the address is absent from the allow-set
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Expired
                | SessionStatus::Revoked
                | SessionStatus::QuotaExceeded
                | SessionStatus::Archived
        )
    }

    /// Pending or Active: the row that blocks a second session for the address
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Active)
    }
}

/// Why a session was moved to a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalReason {
    /// Tier duration elapsed
    Expired,
    /// Superseded, disconnected, or the grant could not be confirmed
    Revoked,
    /// Data quota exhausted
    QuotaExceeded,
}

impl TerminalReason {
    /// The status a session lands in for this reason
    pub fn status(&self) -> SessionStatus {
        match self {
            TerminalReason::Expired => SessionStatus::Expired,
            TerminalReason::Revoked => SessionStatus::Revoked,
            TerminalReason::QuotaExceeded => SessionStatus::QuotaExceeded,
        }
    }
}

/// One grant of metered access to one client address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique identifier
    pub id: Uuid,
    /// Client network address (at most one live session per address)
    pub client_addr: ClientAddr,
    /// Client MAC if the portal reported one (metadata, not identity)
    pub mac: Option<String>,
    /// Tier name; limits are resolved through the catalog
    pub tier: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry, derived from the tier duration at creation; immutable.
    /// A renewal creates a new session, it does not move this one.
    pub expires_at: DateTime<Utc>,
    /// Bytes attributed to this session; written only by the quota meter
    pub data_used_bytes: u64,
    /// When the session reached a terminal status (drives archival)
    pub ended_at: Option<DateTime<Utc>>,
    /// Lifecycle status
    pub status: SessionStatus,
}

impl Session {
    /// Build a new Pending session for `addr` under `tier`
    pub fn new(addr: ClientAddr, mac: Option<String>, tier: &TierDef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_addr: addr,
            mac,
            tier: tier.name.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(tier.duration_secs as i64),
            data_used_bytes: 0,
            ended_at: None,
            status: SessionStatus::Pending,
        }
    }

    /// Whether the tier window has closed as of `now`
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
