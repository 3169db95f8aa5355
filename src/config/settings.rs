//! Relay configuration
//!
//! Optional TOML file with `[server]` and `[client]` sections. Values given
//! on the command line win over the file, the file wins over the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::client::{ClientConfig, DEFAULT_HEARTBEAT, DEFAULT_SERVER_ADDR};
use crate::server::{ServerConfig, DEFAULT_WRITE_TIMEOUT};

/// Server id used when none is configured
pub const DEFAULT_SERVER_ID: &str = "demo";

/// Listen address used when none is configured
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";

/// Errors that can occur while loading or resolving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("A client user id is required (--user or [client] user)")]
    MissingUser,
    #[error("Heartbeat interval must be at least one second")]
    InvalidHeartbeat,
    #[error("Write timeout must be at least one second")]
    InvalidWriteTimeout,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerSection {
    pub id: Option<String>,
    pub listen: Option<String>,
    pub write_timeout_secs: Option<u64>,
}

/// `[client]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClientSection {
    pub addr: Option<String>,
    pub user: Option<String>,
    pub heartbeat_secs: Option<u64>,
}

/// Server settings given on the command line
#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub id: Option<String>,
    pub listen: Option<String>,
}

/// Client settings given on the command line
#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    pub addr: Option<String>,
    pub user: Option<String>,
    pub heartbeat_secs: Option<u64>,
}

/// Contents of a relay config file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if one was given, otherwise start from defaults
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Resolve the server configuration
    pub fn server_config(&self, overrides: ServerOverrides) -> Result<ServerConfig, ConfigError> {
        let id = overrides
            .id
            .or_else(|| self.server.id.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_ID.to_string());
        let listen = overrides
            .listen
            .or_else(|| self.server.listen.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let write_timeout = match self.server.write_timeout_secs {
            Some(0) => return Err(ConfigError::InvalidWriteTimeout),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_WRITE_TIMEOUT,
        };

        Ok(ServerConfig::new(id, listen).with_write_timeout(write_timeout))
    }

    /// Resolve the client configuration; the user id must be present
    pub fn client_config(&self, overrides: ClientOverrides) -> Result<ClientConfig, ConfigError> {
        let addr = overrides
            .addr
            .or_else(|| self.client.addr.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());
        let user = overrides
            .user
            .or_else(|| self.client.user.clone())
            .filter(|user| !user.is_empty())
            .ok_or(ConfigError::MissingUser)?;
        let heartbeat = match overrides.heartbeat_secs.or(self.client.heartbeat_secs) {
            Some(0) => return Err(ConfigError::InvalidHeartbeat),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_HEARTBEAT,
        };

        Ok(ClientConfig::new(addr, user).with_heartbeat(heartbeat))
    }
}
