//! Tier catalog
//!
//! Service levels the captive portal sells. The catalog is owned by
//! configuration; the broker reads it and never mutates it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A named service tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDef {
    /// Tier name (the tag the shaping layer consumes)
    pub name: String,
    /// Session duration in seconds
    pub duration_secs: u64,
    /// Download cap in kbit/s (0 = unlimited)
    pub down_kbps: u32,
    /// Upload cap in kbit/s (0 = unlimited)
    pub up_kbps: u32,
    /// Data quota in bytes
    pub data_quota_bytes: u64,
    /// Price in cents
    pub price_cents: u32,
}

impl TierDef {
    /// Session duration as a [`Duration`]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Closed, configuration-defined set of tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierCatalog {
    tiers: Vec<TierDef>,
}

impl TierCatalog {
    /// Build a catalog from explicit tier definitions
    pub fn new(tiers: Vec<TierDef>) -> Self {
        Self { tiers }
    }

    /// Look up a tier by name
    pub fn get(&self, name: &str) -> Option<&TierDef> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// All tiers, in catalog order
    pub fn all(&self) -> &[TierDef] {
        &self.tiers
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierDef {
                    name: "free".into(),
                    duration_secs: 30 * 60,
                    down_kbps: 1_000,
                    up_kbps: 512,
                    data_quota_bytes: 100 * 1024 * 1024,
                    price_cents: 0,
                },
                TierDef {
                    name: "lightweight".into(),
                    duration_secs: 4 * 3600,
                    down_kbps: 5_000,
                    up_kbps: 2_000,
                    data_quota_bytes: 1024 * 1024 * 1024,
                    price_cents: 200,
                },
                TierDef {
                    name: "premium".into(),
                    duration_secs: 24 * 3600,
                    down_kbps: 0,
                    up_kbps: 0,
                    data_quota_bytes: 10 * 1024 * 1024 * 1024,
                    price_cents: 500,
                },
            ],
        }
    }
}
