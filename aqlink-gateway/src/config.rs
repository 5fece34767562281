// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for aqlink Gateway
//!
//! One immutable [`CollectorConfig`] is loaded at start-up and handed by
//! reference to each component's constructor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Broker endpoints to subscribe to
    pub brokers: Vec<BrokerConfig>,
    /// Kit identity cache tuning
    pub cache: CacheConfig,
    /// Reconnect and stall policy shared by all brokers
    pub connection: ConnectionConfig,
    /// Queue and polling
    pub dispatcher: DispatcherConfig,
    /// Accepted measurement names
    pub schema: SchemaConfig,
    /// Recorded envelope files
    pub replay: ReplayConfig,
    /// Extra product rules, overlaid on the built-in table
    pub rules: Option<PathBuf>,
    /// Kit registration file
    pub registry: Option<PathBuf>,
}

impl CollectorConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&document)
    }

    /// Check ranges and cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |setting: &str, reason: &str| ConfigError::Invalid {
            setting: setting.to_string(),
            reason: reason.to_string(),
        };

        let mut names = std::collections::HashSet::new();
        for broker in &self.brokers {
            if broker.name.is_empty() {
                return Err(invalid("brokers.name", "must not be empty"));
            }
            if !names.insert(&broker.name) {
                return Err(invalid("brokers.name", &format!("duplicate broker {}", broker.name)));
            }
            if broker.host.is_empty() {
                return Err(invalid("brokers.host", "must not be empty"));
            }
            if broker.topic.is_empty() {
                return Err(invalid("brokers.topic", "must not be empty"));
            }
            if broker.qos > 2 {
                return Err(invalid("brokers.qos", "must be 0, 1 or 2"));
            }
            if broker.keep_alive_secs < 5 {
                return Err(invalid("brokers.keep_alive_secs", "must be at least 5"));
            }
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "must be positive"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs", "must be positive"));
        }
        if self.connection.max_restarts == 0 {
            return Err(invalid("connection.max_restarts", "must be positive"));
        }
        if self.connection.backoff_multiplier < 1.0 {
            return Err(invalid("connection.backoff_multiplier", "must be at least 1"));
        }
        if self.connection.backoff_max_secs < self.connection.backoff_initial_secs {
            return Err(invalid(
                "connection.backoff_max_secs",
                "must not be below backoff_initial_secs",
            ));
        }
        if self.connection.max_envelope_fields == 0 {
            return Err(invalid("connection.max_envelope_fields", "must be positive"));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(invalid("dispatcher.queue_capacity", "must be positive"));
        }
        Ok(())
    }
}

/// One MQTT broker endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name used in logs and status
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client id; a name-derived id is used when empty
    pub client_id: String,
    /// Subscription topic pattern, e.g. `v3/+/devices/+/up`
    pub topic: String,
    pub keep_alive_secs: u64,
    /// Delivery quality (MQTT QoS 0..2)
    pub qos: u8,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "ttn".to_string(),
            host: "eu1.cloud.thethings.network".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: String::new(),
            topic: "v3/+/devices/+/up".to_string(),
            keep_alive_secs: 180,
            qos: 0,
        }
    }
}

impl BrokerConfig {
    /// Client id to present to the broker
    pub fn client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("aqlink-{}", self.name)
        } else {
            self.client_id.clone()
        }
    }
}

/// Kit identity cache tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
    /// Evicted statistics kept for carry-forward
    pub history: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            ttl_secs: 6 * 3600,
            history: 200,
        }
    }
}

/// Reconnect and stall detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// No data for this long means the session stalled
    pub data_timeout_secs: u64,
    /// Minimum time connected before a stall counts
    pub min_uptime_secs: u64,
    /// Failed connects inside the window before retiring
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub backoff_initial_secs: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_secs: u64,
    pub connect_timeout_secs: u64,
    /// Envelopes with more top-level fields are dropped
    pub max_envelope_fields: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            data_timeout_secs: 3600,
            min_uptime_secs: 900,
            max_restarts: 5,
            restart_window_secs: 3600,
            backoff_initial_secs: 10,
            backoff_multiplier: 2.0,
            backoff_max_secs: 600,
            connect_timeout_secs: 30,
            max_envelope_fields: 25,
        }
    }
}

/// Queue and polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    /// Idle wait between polls
    pub poll_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            poll_interval_ms: 500,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Accepted measurement names beyond the rule table's own
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub fields: Vec<String>,
    /// Alternative spelling to accepted name
    pub aliases: BTreeMap<String, String>,
}

/// Recorded envelope files, replayed before live data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub files: Vec<PathBuf>,
}
