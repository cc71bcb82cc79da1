// Configuration management for the MeshVault node.
//
// Cross-platform config stored in:
// - macOS/Linux: ~/.config/meshvault/config.json
// - Windows: %APPDATA%\meshvault\config.json

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use meshvault_core::NodeConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
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
    pub storage_path: Option<String>,
    pub max_onion_path_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = NodeConfig::default();
        Self {
            peer_port: defaults.peer_port,
            loopback_port: defaults.loopback_port,
            multicast_group: defaults.multicast_group,
            multicast_port: defaults.multicast_port,
            broadcast_interval_secs: defaults.broadcast_interval_secs,
            bind_ip: defaults.bind_ip,
            multicast_cidr: defaults.multicast_cidr,
            interface_name: defaults.interface_name,
            escrow_url: defaults.escrow_url,
            escrow_token: defaults.escrow_token,
            hostname: defaults.hostname,
            storage_path: None,
            max_onion_path_len: defaults.max_onion_path_len,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform).
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("failed to determine config directory")?
            .join("meshvault");
        std::fs::create_dir_all(&config_dir).context("failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform).
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("failed to determine data directory")?
            .join("meshvault");
        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create the default one if it doesn't exist.
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents = std::fs::read_to_string(&config_file).context("failed to read config file")?;
            let config: Config = serde_json::from_str(&contents).context("failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&config_file, contents).context("failed to write config file")?;
        Ok(())
    }

    pub fn base_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Self::data_dir(),
        }
    }

    /// Build the immutable `NodeConfig` record engines are constructed
    /// with, resolving the storage path against the data directory.
    pub fn to_node_config(&self) -> Result<NodeConfig> {
        Ok(NodeConfig {
            peer_port: self.peer_port,
            loopback_port: self.loopback_port,
            multicast_group: self.multicast_group,
            multicast_port: self.multicast_port,
            broadcast_interval_secs: self.broadcast_interval_secs,
            bind_ip: self.bind_ip,
            multicast_cidr: self.multicast_cidr.clone(),
            interface_name: self.interface_name.clone(),
            escrow_url: self.escrow_url.clone(),
            escrow_token: self.escrow_token.clone(),
            hostname: self.hostname.clone(),
            base_dir: self.base_dir()?,
            max_onion_path_len: self.max_onion_path_len,
        })
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "peer_port" => self.peer_port = value.parse().context("invalid port number")?,
            "loopback_port" => self.loopback_port = value.parse().context("invalid port number")?,
            "multicast_port" => self.multicast_port = value.parse().context("invalid port number")?,
            "broadcast_interval_secs" => {
                self.broadcast_interval_secs = value.parse().context("invalid number")?
            }
            "interface_name" => {
                self.interface_name = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            "escrow_url" => self.escrow_url = value.to_string(),
            "escrow_token" => {
                self.escrow_token = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            "hostname" => self.hostname = value.to_string(),
            "storage_path" => {
                self.storage_path = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            _ => anyhow::bail!("unknown config key: {key}"),
        }
        self.save()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "peer_port" => Some(self.peer_port.to_string()),
            "loopback_port" => Some(self.loopback_port.to_string()),
            "multicast_port" => Some(self.multicast_port.to_string()),
            "broadcast_interval_secs" => Some(self.broadcast_interval_secs.to_string()),
            "interface_name" => self.interface_name.clone(),
            "escrow_url" => Some(self.escrow_url.clone()),
            "hostname" => Some(self.hostname.clone()),
            "storage_path" => self.storage_path.clone(),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("peer_port".to_string(), self.peer_port.to_string()),
            ("loopback_port".to_string(), self.loopback_port.to_string()),
            ("multicast_group".to_string(), self.multicast_group.to_string()),
            ("multicast_port".to_string(), self.multicast_port.to_string()),
            ("broadcast_interval_secs".to_string(), self.broadcast_interval_secs.to_string()),
            ("interface_name".to_string(), self.interface_name.clone().unwrap_or_else(|| "(auto)".to_string())),
            ("escrow_url".to_string(), self.escrow_url.clone()),
            ("hostname".to_string(), self.hostname.clone()),
            ("storage_path".to_string(), self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string())),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_node_config_defaults() {
        let config = Config::default();
        let node_defaults = NodeConfig::default();
        assert_eq!(config.peer_port, node_defaults.peer_port);
        assert_eq!(config.loopback_port, node_defaults.loopback_port);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.peer_port, deserialized.peer_port);
    }

    #[test]
    fn set_and_get_known_key() {
        let mut config = Config::default();
        config.storage_path = Some("/tmp/will-not-save-in-test".to_string());
        config.peer_port = 9999;
        assert_eq!(config.get("peer_port"), Some("9999".to_string()));
    }
}
