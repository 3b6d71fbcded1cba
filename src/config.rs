// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load the FCP server configuration from TOML.
// Author: Lukas Bower

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::connection::DEFAULT_QUEUE_LEN;
use crate::node::NodeInfo;

/// Environment variable naming the config file when no path is given.
pub const CONFIG_ENV: &str = "FCP_CONFIG";
/// Port the FCP server listens on by default.
pub const DEFAULT_PORT: u16 = 9481;

/// FCP server settings. Absent keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FcpConfig {
    /// Whether the server accepts connections at all.
    pub enabled: bool,
    /// Address the listener binds to.
    pub bind_to: String,
    pub port: u16,
    /// Hosts allowed to connect; `*` admits everyone.
    pub allowed_hosts: Vec<String>,
    /// Hosts granted full access; `*` admits everyone.
    pub allowed_hosts_full_access: Vec<String>,
    /// Outbound messages buffered per connection before it is dropped.
    pub max_message_queue_length: usize,
    /// Largest accepted `DataLength`.
    pub max_data_length: u64,
    /// Forever-request store; persistence is disabled without it.
    pub persistence_file: Option<PathBuf>,
    pub node_name: String,
    pub node_version: Option<String>,
}

impl Default for FcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_to: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            allowed_hosts: vec!["127.0.0.1".to_owned(), "::1".to_owned()],
            allowed_hosts_full_access: vec!["127.0.0.1".to_owned(), "::1".to_owned()],
            max_message_queue_length: DEFAULT_QUEUE_LEN,
            max_data_length: fcp_wire::MAX_DATA_LEN,
            persistence_file: None,
            node_name: NodeInfo::default().name,
            node_version: None,
        }
    }
}

impl FcpConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid FCP config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the file named by `FCP_CONFIG`, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read FCP config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.max_message_queue_length == 0 {
            return Err(anyhow!("max_message_queue_length must be at least 1"));
        }
        for host in self
            .allowed_hosts
            .iter()
            .chain(self.allowed_hosts_full_access.iter())
        {
            if host != "*" && host.parse::<IpAddr>().is_err() {
                return Err(anyhow!("allowed host {host:?} is not an IP address or *"));
            }
        }
        Ok(())
    }

    /// `bind_to:port`.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        match self.bind_to.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]:{}", self.port),
            _ => format!("{}:{}", self.bind_to, self.port),
        }
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        host_matches(&self.allowed_hosts, ip)
    }

    pub fn has_full_access(&self, ip: IpAddr) -> bool {
        host_matches(&self.allowed_hosts_full_access, ip)
    }

    /// Identity announced in `NodeHello`.
    #[must_use]
    pub fn node_info(&self) -> NodeInfo {
        let defaults = NodeInfo::default();
        NodeInfo {
            name: self.node_name.clone(),
            version: self.node_version.clone().unwrap_or(defaults.version),
            fcp_version: defaults.fcp_version,
        }
    }
}

fn host_matches(hosts: &[String], ip: IpAddr) -> bool {
    hosts
        .iter()
        .any(|host| host == "*" || host.parse::<IpAddr>().is_ok_and(|allowed| allowed == ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = FcpConfig::from_toml("port = 9500\n").unwrap();
        assert_eq!(config.port, 9500);
        assert!(config.enabled);
        assert!(config.persistence_file.is_none());
        assert_eq!(config.listen_addr(), "127.0.0.1:9500");
    }

    #[test]
    fn unknown_keys_and_bad_hosts_are_rejected() {
        assert!(FcpConfig::from_toml("prot = 1\n").is_err());
        assert!(FcpConfig::from_toml("allowed_hosts = [\"example.org\"]\n").is_err());
    }

    #[test]
    fn wildcard_admits_everyone() {
        let config = FcpConfig::from_toml("allowed_hosts = [\"*\"]\nallowed_hosts_full_access = []\n").unwrap();
        let remote: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(config.is_allowed(remote));
        assert!(!config.has_full_access(remote));
    }
}
