//! Configuration structures for service discovery

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Service discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Tree path under which services are registered
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Create attempts per registration before the error is surfaced
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,
    /// Delay before re-registering after a reconnect, in milliseconds
    #[serde(default = "default_reconnect_grace_ms")]
    pub reconnect_grace_ms: u64,
}

fn default_base_path() -> String {
    "/services".to_string()
}

fn default_register_attempts() -> u32 {
    3
}

fn default_reconnect_grace_ms() -> u64 {
    5_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            register_attempts: default_register_attempts(),
            reconnect_grace_ms: default_reconnect_grace_ms(),
        }
    }
}

impl DiscoveryConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = async_fs::read_to_string(path.as_ref()).await?;

        // YAML by extension, JSON otherwise
        match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&contents)?),
            _ => Ok(serde_json::from_str(&contents)?),
        }
    }

    /// Use a different base path
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Use a different reconnect grace period
    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Reconnect grace period
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }
}
