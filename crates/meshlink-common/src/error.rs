//! Error types for MeshLink

use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionStatus;

/// MeshLink broker error type
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Address already bound to a non-superseded session
    #[error("address {0} already has an active session")]
    Conflict(String),

    /// Tier name not present in the catalog
    #[error("unknown tier: {0}")]
    UnknownTier(String),

    /// Kernel-side grant/revoke could not be confirmed after retry
    #[error("enforcement failure: {0}")]
    EnforcementFailure(String),

    /// Operation on a nonexistent session id
    #[error("session not found: {0}")]
    NotFound(Uuid),

    /// Usage update on a session that is not Active
    #[error("session {id} is {status:?}, operation requires Active")]
    InvalidState {
        /// Session id
        id: Uuid,
        /// Status the row was actually in
        status: SessionStatus,
    },

    /// Durable state read/write failure
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Result type for MeshLink
pub type BrokerResult<T> = Result<T, BrokerError>;
