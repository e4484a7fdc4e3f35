//! MeshLink Common - Shared types for the session authorization broker
//!
//! This crate provides the vocabulary the broker components share:
//! - Client address value object
//! - Tier catalog (configuration-defined service levels)
//! - Session lifecycle model
//! - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod error;
pub mod session;
pub mod tier;

pub use addr::ClientAddr;
pub use error::{BrokerError, BrokerResult};
pub use session::{Session, SessionStatus, TerminalReason};
pub use tier::{TierCatalog, TierDef};
