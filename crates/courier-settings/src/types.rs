//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every section has `#[serde(default)]`
//! so a settings file only needs the keys it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for one node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Fixed instance identity. Generated at startup when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub server: ServerSettings,
    pub manager: ManagerSettings,
    pub store: StoreSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject values that would make the node unusable.
    pub fn validate(&self) -> Result<()> {
        if self.manager.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue("manager.queueCapacity must be > 0".into()));
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidValue("broker.pollIntervalMs must be > 0".into()));
        }
        if self.broker.exchange.trim().is_empty() {
            return Err(SettingsError::InvalidValue("broker.exchange must not be empty".into()));
        }
        if let Some(id) = &self.instance_id {
            if id.trim().is_empty() {
                return Err(SettingsError::InvalidValue("instanceId must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// WebSocket front door.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Interval between keepalive pings on client sockets.
    pub keepalive_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9100,
            keepalive_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerSettings {
    /// Capacity of the dispatch queue shared by all ingestion pipelines.
    pub queue_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

/// Shared SQLite database holding the routing table and broker queues.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Database file. Relative paths resolve against `~/.courier`.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "courier.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Direct exchange shared by every instance of one deployment.
    pub exchange: String,
    /// How long an idle consumer waits before polling its queue again.
    pub poll_interval_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            exchange: "courier-router".to_string(),
            poll_interval_ms: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `compact`.
    pub format: String,
    /// Per-module level overrides, e.g. `{"courier_store": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            modules: BTreeMap::new(),
        }
    }
}
