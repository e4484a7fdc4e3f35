//! Client address value object

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Network-layer identity of a captive-portal client.
///
/// Clients are identified by IP address only; a MAC, when the portal
/// supplies one, travels on the session as metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientAddr(IpAddr);

impl ClientAddr {
    /// The underlying IP address
    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for ClientAddr {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl FromStr for ClientAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: ClientAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(addr.to_string(), "10.0.0.5");

        let v6: ClientAddr = "fd00::1".parse().unwrap();
        assert_eq!(v6.to_string(), "fd00::1");
    }

    #[test]
    fn test_serde_as_string() {
        let addr: ClientAddr = "192.168.4.20".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"192.168.4.20\"");
        let back: ClientAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
