//! MeshLink Daemon - metered WiFi gateway broker
//!
//! Long-running daemon that wires the broker core to its collaborators:
//! the durable session store, an enforcement backend, the expiry
//! scheduler, the quota meter, the reconciler, and the portal-facing
//! HTTP API.

#![warn(missing_docs)]

pub mod api;
pub mod config;

pub use config::{DaemonConfig, GatewayBackend};
