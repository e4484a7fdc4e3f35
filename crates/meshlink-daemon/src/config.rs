//! Daemon configuration

use serde::{Deserialize, Serialize};

use meshlink_common::TierCatalog;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// HTTP listen address for the portal-facing API
    pub listen_addr: String,
    /// Durable session table location
    pub state_path: String,
    /// Subnets clients may authorize from; empty = no restriction
    pub client_subnets: Vec<String>,
    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
    /// Seconds between quota meter polls
    pub meter_interval_secs: u64,
    /// Days terminal sessions are retained before archival
    pub archive_after_days: i64,
    /// Enforcement backend
    pub gateway: GatewayBackend,
    /// Tier catalog the portal sells
    pub tiers: TierCatalog,
}

/// Which enforcement backend to drive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum GatewayBackend {
    /// In-process sets, no kernel side effects (dry runs, tests)
    Memory,
    /// nftables named sets via the `nft` binary
    Nft {
        /// inet table holding the sets
        table: String,
        /// Global allow-set name
        allow_set: String,
    },
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            state_path: "/var/lib/meshlink/sessions.json".into(),
            client_subnets: vec!["10.0.0.0/24".into()],
            reconcile_interval_secs: 60,
            meter_interval_secs: 10,
            archive_after_days: 7,
            gateway: GatewayBackend::Nft {
                table: "meshlink".into(),
                allow_set: "allowed".into(),
            },
            tiers: TierCatalog::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Parsed client subnets (invalid entries are rejected at startup)
    pub fn parsed_subnets(&self) -> Result<Vec<ipnetwork::IpNetwork>, ipnetwork::IpNetworkError> {
        self.client_subnets.iter().map(|s| s.parse()).collect()
    }
}
