//! Process-wide static configuration, expressed as an immutable record
//! built once at startup (`spec.md` §9 "Process-wide static
//! configuration"). Passed by `Arc` into each engine constructor; the one
//! genuinely mutable value — the forced interface override — lives on
//! the owning component (`BeaconTransport`), not here.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::beacon::iface::Ipv4Cidr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub peer_port: u16,
    pub loopback_port: u16,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub broadcast_interval_secs: u64,
    pub bind_ip: Option<IpAddr>,
    pub multicast_cidr: Option<String>,
    pub interface_name: Option<String>,
    pub escrow_url: String,
    pub escrow_token: Option<String>,
    pub hostname: String,
    pub base_dir: std::path::PathBuf,
    pub max_onion_path_len: usize,
}

impl NodeConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn multicast_cidr_parsed(&self) -> Option<Ipv4Cidr> {
        self.multicast_cidr.as_deref().and_then(Ipv4Cidr::parse)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_port: 8080,
            loopback_port: 8081,
            multicast_group: Ipv4Addr::new(239, 77, 77, 1),
            multicast_port: 7077,
            broadcast_interval_secs: 3,
            bind_ip: None,
            multicast_cidr: None,
            interface_name: None,
            escrow_url: "http://127.0.0.1:9090".to_string(),
            escrow_token: None,
            hostname: "meshvault-node".to_string(),
            base_dir: std::path::PathBuf::from("."),
            max_onion_path_len: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ports() {
        let config = NodeConfig::default();
        assert_eq!(config.peer_port, 8080);
        assert_eq!(config.loopback_port, 8081);
        assert_ne!(config.peer_port, config.loopback_port);
    }

    #[test]
    fn broadcast_interval_converts_seconds() {
        let config = NodeConfig::default();
        assert_eq!(config.broadcast_interval(), Duration::from_secs(3));
    }
}
