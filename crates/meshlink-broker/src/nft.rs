//! nftables-backed enforcement gateway
//!
//! Drives a named allow-set plus per-tier sets in an `inet` table via the
//! `nft` binary. The forwarding chain is provisioned by the host bootstrap
//! (outside this crate); sets are created with per-element counters, which
//! is where byte usage comes from. Removing an element drops its counter,
//! so a re-granted address always starts from zero.

use std::collections::HashSet;
use std::net::IpAddr;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;

use meshlink_common::ClientAddr;

use crate::enforce::{EnforceError, EnforcementGateway};

/// Gateway over nftables named sets
pub struct NftSetGateway {
    /// inet table holding the sets, e.g. "meshlink"
    table: String,
    /// Global allow-set consulted by the forward chain, e.g. "allowed"
    allow_set: String,
    /// Tier names; each maps to a set named `tier_<name>`
    tier_names: Vec<String>,
}

impl NftSetGateway {
    /// Build a gateway for the given table/set layout
    pub fn new(table: impl Into<String>, allow_set: impl Into<String>, tier_names: Vec<String>) -> Self {
        Self {
            table: table.into(),
            allow_set: allow_set.into(),
            tier_names,
        }
    }

    fn tier_set(tier: &str) -> String {
        format!("tier_{tier}")
    }

    async fn run(&self, args: &[&str]) -> Result<Output, EnforceError> {
        Command::new("nft")
            .args(args)
            .output()
            .await
            .map_err(|e| EnforceError::Backend(format!("nft spawn: {e}")))
    }

    /// Run an nft mutation, treating `tolerable` stderr fragments as success
    async fn run_mutation(&self, args: &[&str], tolerable: &str) -> Result<(), EnforceError> {
        let out = self.run(args).await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains(tolerable) {
            return Ok(());
        }
        Err(EnforceError::Backend(format!(
            "nft {}: {}",
            args.join(" "),
            stderr.trim()
        )))
    }

    async fn add_element(&self, set: &str, ip: IpAddr) -> Result<(), EnforceError> {
        let elem = format!("{{ {ip} }}");
        // Already-present element is an idempotent success
        self.run_mutation(
            &["add", "element", "inet", &self.table, set, &elem],
            "File exists",
        )
        .await
    }

    async fn delete_element(&self, set: &str, ip: IpAddr) -> Result<(), EnforceError> {
        let elem = format!("{{ {ip} }}");
        // Absent element is an idempotent success
        self.run_mutation(
            &["delete", "element", "inet", &self.table, set, &elem],
            "No such file or directory",
        )
        .await
    }

    async fn list_allow_set(&self) -> Result<Vec<(IpAddr, u64)>, EnforceError> {
        let out = self
            .run(&["-j", "list", "set", "inet", &self.table, &self.allow_set])
            .await?;
        if !out.status.success() {
            return Err(EnforceError::Backend(format!(
                "nft list set: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        parse_set_elements(&String::from_utf8_lossy(&out.stdout))
    }
}

/// Parse `nft -j list set` output into (address, counter-bytes) pairs.
///
/// Elements appear either as bare strings or as `{"elem": {"val": ...,
/// "counter": {"bytes": ...}}}` when the set carries per-element counters.
pub fn parse_set_elements(json: &str) -> Result<Vec<(IpAddr, u64)>, EnforceError> {
    let doc: serde_json::Value =
        serde_json::from_str(json).map_err(|e| EnforceError::Backend(format!("nft json: {e}")))?;

    let mut elements = Vec::new();
    let objects = doc
        .get("nftables")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EnforceError::Backend("nft json: missing nftables array".into()))?;

    for obj in objects {
        let Some(set) = obj.get("set") else { continue };
        let Some(elems) = set.get("elem").and_then(|v| v.as_array()) else {
            continue;
        };
        for elem in elems {
            let (val, bytes) = match elem {
                serde_json::Value::String(s) => (s.as_str(), 0),
                other => {
                    let inner = other.get("elem").unwrap_or(other);
                    let Some(val) = inner.get("val").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let bytes = inner
                        .get("counter")
                        .and_then(|c| c.get("bytes"))
                        .and_then(|b| b.as_u64())
                        .unwrap_or(0);
                    (val, bytes)
                }
            };
            if let Ok(ip) = val.parse::<IpAddr>() {
                elements.push((ip, bytes));
            }
        }
    }
    Ok(elements)
}

#[async_trait]
impl EnforcementGateway for NftSetGateway {
    async fn grant(&self, addr: ClientAddr, tier: &str) -> Result<(), EnforceError> {
        self.add_element(&self.allow_set, addr.ip()).await?;
        self.add_element(&Self::tier_set(tier), addr.ip()).await
    }

    async fn revoke(&self, addr: ClientAddr) -> Result<(), EnforceError> {
        self.delete_element(&self.allow_set, addr.ip()).await?;
        // Membership in exactly one tier set is not tracked here; sweep all
        for tier in &self.tier_names {
            self.delete_element(&Self::tier_set(tier), addr.ip()).await?;
        }
        Ok(())
    }

    async fn list_granted(&self) -> Result<HashSet<IpAddr>, EnforceError> {
        Ok(self.list_allow_set().await?.into_iter().map(|(ip, _)| ip).collect())
    }

    async fn read_usage_bytes(&self, addr: ClientAddr) -> Result<u64, EnforceError> {
        Ok(self
            .list_allow_set()
            .await?
            .into_iter()
            .find(|(ip, _)| *ip == addr.ip())
            .map(|(_, bytes)| bytes)
            .unwrap_or(0))
    }

    async fn reset_usage(&self, addr: ClientAddr) -> Result<(), EnforceError> {
        let elem = format!("{{ {} }}", addr.ip());
        // Counters die with their element, so a missing element is fine
        self.run_mutation(
            &["reset", "element", "inet", &self.table, &self.allow_set, &elem],
            "No such file or directory",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_elements_with_counters() {
        let json = r#"{
            "nftables": [
                {"metainfo": {"version": "1.0.9"}},
                {"set": {
                    "family": "inet", "name": "allowed", "table": "meshlink",
                    "type": "ipv4_addr",
                    "elem": [
                        {"elem": {"val": "10.0.0.5", "counter": {"packets": 42, "bytes": 10240}}},
                        {"elem": {"val": "10.0.0.9", "counter": {"packets": 0, "bytes": 0}}}
                    ]
                }}
            ]
        }"#;

        let elems = parse_set_elements(json).unwrap();
        assert_eq!(elems.len(), 2);
        assert_eq!(elems[0], ("10.0.0.5".parse().unwrap(), 10240));
        assert_eq!(elems[1], ("10.0.0.9".parse().unwrap(), 0));
    }

    #[test]
    fn test_parse_bare_string_elements() {
        let json = r#"{"nftables": [{"set": {"name": "allowed", "elem": ["192.168.4.20"]}}]}"#;
        let elems = parse_set_elements(json).unwrap();
        assert_eq!(elems, vec![("192.168.4.20".parse().unwrap(), 0)]);
    }

    #[test]
    fn test_parse_empty_set() {
        let json = r#"{"nftables": [{"set": {"name": "allowed"}}]}"#;
        assert!(parse_set_elements(json).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_set_elements("not json").is_err());
        assert!(parse_set_elements(r#"{"other": []}"#).is_err());
    }
}
