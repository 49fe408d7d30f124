//! Listener settings, as found in the daemon's configuration file.

use crate::listener::PortRange;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read listener configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse listener configuration")]
    Parse(#[from] toml::de::Error),
    #[error("Client port range {0}-{1} is empty")]
    InvalidPortRange(u16, u16),
    #[error("Listen queue depth must be at least 1")]
    ZeroBacklog,
}

/// Remote listener settings.
///
/// Every key is optional, the defaults leave the listener disabled:
/// ```toml
/// tcp_listen_port = 60
/// tcp_listen_queue = 5
/// tcp_client_min_port = 1
/// tcp_client_max_port = 1023
/// tcp_client_idle_check_secs = 60
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// TCP port to accept remote agents on, 0 disables the listener
    pub tcp_listen_port: u16,
    /// Backlog of pending connections
    pub tcp_listen_queue: u32,
    /// Lowest accepted source port of a remote agent
    pub tcp_client_min_port: u16,
    /// Highest accepted source port of a remote agent
    pub tcp_client_max_port: u16,
    /// Seconds between idle client scans, 0 turns the scan off
    pub tcp_client_idle_check_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tcp_listen_port: 0,
            tcp_listen_queue: 5,
            tcp_client_min_port: 1,
            tcp_client_max_port: u16::MAX,
            tcp_client_idle_check_secs: 60,
        }
    }
}

impl ListenerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_client_min_port > self.tcp_client_max_port {
            return Err(ConfigError::InvalidPortRange(
                self.tcp_client_min_port,
                self.tcp_client_max_port,
            ));
        }
        if self.tcp_listen_queue == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.tcp_listen_port != 0
    }

    /// All interfaces, on the configured port
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.tcp_listen_port))
    }

    pub fn allowed_ports(&self) -> PortRange {
        PortRange::new(self.tcp_client_min_port, self.tcp_client_max_port)
    }

    pub fn idle_check_interval(&self) -> Option<Duration> {
        match self.tcp_client_idle_check_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ConfigError, ListenerConfig};
    use anyhow::Result;
    use std::time::Duration;

    #[test]
    fn defaults_disable_listener() -> Result<()> {
        let config = ListenerConfig::from_toml_str("")?;
        assert_eq!(config, ListenerConfig::default());
        assert!(!config.is_enabled());
        assert!(config.allowed_ports().contains(1));
        assert!(config.allowed_ports().contains(u16::MAX));
        assert!(!config.allowed_ports().contains(0));
        Ok(())
    }

    #[test]
    fn parses_listener_keys() -> Result<()> {
        let config = ListenerConfig::from_toml_str(
            r#"
            tcp_listen_port = 60
            tcp_listen_queue = 16
            tcp_client_min_port = 1
            tcp_client_max_port = 1023
            tcp_client_idle_check_secs = 0
            "#,
        )?;
        assert!(config.is_enabled());
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:60");
        assert_eq!(config.tcp_listen_queue, 16);
        assert!(config.allowed_ports().contains(1023));
        assert!(!config.allowed_ports().contains(2000));
        assert_eq!(config.idle_check_interval(), None);
        assert_eq!(
            ListenerConfig::default().idle_check_interval(),
            Some(Duration::from_secs(60))
        );
        Ok(())
    }

    #[test]
    fn rejects_inverted_port_range() {
        let res = ListenerConfig::from_toml_str(
            "tcp_client_min_port = 2000\ntcp_client_max_port = 1000",
        );
        assert!(matches!(res, Err(ConfigError::InvalidPortRange(2000, 1000))));
    }

    #[test]
    fn rejects_zero_backlog_and_garbage() {
        assert!(matches!(
            ListenerConfig::from_toml_str("tcp_listen_queue = 0"),
            Err(ConfigError::ZeroBacklog)
        ));
        assert!(matches!(
            ListenerConfig::from_toml_str("tcp_listen_port = \"sixty\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
