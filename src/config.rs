//! Process configuration for sensors and gateways.
//!
//! Configuration is read from a JSON or YAML file (chosen by extension) and
//! then overridden from environment variables.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::DEFAULT_HANDOFF_TIMEOUT;
use crate::gateway::{TransformerConfig, SENSOR_SERVICE_PORT};
use crate::retry::RetryPolicy;
use crate::sensor::{SensorSpec, DEFAULT_WATCH_INTERVAL};

pub const ENV_SENSOR_NAME: &str = "SENSOR_NAME";
pub const ENV_SENSOR_NAMESPACE: &str = "SENSOR_NAMESPACE";
pub const ENV_GATEWAY_NAME: &str = "GATEWAY_NAME";
pub const ENV_GATEWAY_NAMESPACE: &str = "GATEWAY_NAMESPACE";
pub const ENV_EVENT_TYPE: &str = "EVENT_TYPE";
pub const ENV_EVENT_TYPE_VERSION: &str = "EVENT_TYPE_VERSION";
pub const ENV_SOURCE: &str = "SOURCE";
pub const ENV_TRANSFORMER_PORT: &str = "TRANSFORMER_PORT";

/// Default port the gateway transformer listens on.
pub const TRANSFORMER_PORT: u16 = 9300;

/// Default port of the sensor stream transport.
pub const SENSOR_STREAM_PORT: u16 = 9301;

const DEFAULT_NAMESPACE: &str = "default";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Unsupported config file extension for '{path}' (expected .json, .yaml or .yml)")]
    UnsupportedFormat { path: String },

    #[error("Invalid value '{value}' for environment variable {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let display = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: display.clone(),
        message: e.to_string(),
    })?;
    let parse_err = |message: String| ConfigError::Parse {
        path: display.clone(),
        message,
    };

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string())),
        Some("yaml" | "yml") => serde_yaml::from_str(&text).map_err(|e| parse_err(e.to_string())),
        _ => Err(ConfigError::UnsupportedFormat { path: display }),
    }
}

fn parse_port(var: &str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })
}

/// Configuration of a sensor process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub name: String,
    pub namespace: String,
    /// Port of the HTTP push endpoint.
    pub port: u16,
    /// Port of the gRPC stream transport.
    pub stream_port: u16,
    pub watch_interval_ms: u64,
    pub handoff_timeout_ms: u64,
    /// Budget for conflict retries when persisting status.
    pub persistence: RetryPolicy,
    /// Seed spec for an embedded store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<SensorSpec>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            port: SENSOR_SERVICE_PORT,
            stream_port: SENSOR_STREAM_PORT,
            watch_interval_ms: u64::try_from(DEFAULT_WATCH_INTERVAL.as_millis()).unwrap_or(1_000),
            handoff_timeout_ms: u64::try_from(DEFAULT_HANDOFF_TIMEOUT.as_millis()).unwrap_or(5_000),
            persistence: RetryPolicy::default(),
            spec: None,
        }
    }
}

impl SensorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_file(path.as_ref())
    }

    /// Applies `SENSOR_NAME` and `SENSOR_NAMESPACE` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|var| std::env::var(var).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup(ENV_SENSOR_NAME) {
            self.name = name;
        }
        if let Some(namespace) = lookup(ENV_SENSOR_NAMESPACE) {
            self.namespace = namespace;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "sensor name is required".to_string(),
            });
        }
        if let Some(spec) = &self.spec {
            spec.validate().map_err(|e| ConfigError::Invalid {
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    #[must_use]
    pub const fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }
}

/// Configuration of a gateway process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub name: String,
    pub namespace: String,
    /// Port of the intake server.
    pub port: u16,
    /// Producer identity stamped on every event.
    pub source: String,
    pub event_type: String,
    pub event_type_version: String,
    /// Sensors every event is delivered to.
    pub targets: Vec<String>,
    /// Port target sensors listen on.
    pub sensor_port: u16,
    /// Budget for waiting on a target address.
    pub resolver: RetryPolicy,
    /// Fixed target addresses; when empty, targets resolve through cluster DNS.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub addresses: BTreeMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            port: TRANSFORMER_PORT,
            source: String::new(),
            event_type: String::new(),
            event_type_version: String::new(),
            targets: Vec::new(),
            sensor_port: SENSOR_SERVICE_PORT,
            resolver: RetryPolicy::default(),
            addresses: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_file(path.as_ref())
    }

    /// Applies the gateway environment variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup(ENV_GATEWAY_NAME) {
            self.name = v;
        }
        if let Some(v) = lookup(ENV_GATEWAY_NAMESPACE) {
            self.namespace = v;
        }
        if let Some(v) = lookup(ENV_SOURCE) {
            self.source = v;
        }
        if let Some(v) = lookup(ENV_EVENT_TYPE) {
            self.event_type = v;
        }
        if let Some(v) = lookup(ENV_EVENT_TYPE_VERSION) {
            self.event_type_version = v;
        }
        if let Some(v) = lookup(ENV_TRANSFORMER_PORT) {
            self.port = parse_port(ENV_TRANSFORMER_PORT, v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "gateway name is required".to_string(),
            });
        }
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "gateway must declare at least one target sensor".to_string(),
            });
        }
        if self.event_type.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "event type is required".to_string(),
            });
        }
        if self.source.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "event source is required".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn transformer(&self) -> TransformerConfig {
        TransformerConfig {
            source: self.source.clone(),
            event_type: self.event_type.clone(),
            event_type_version: self.event_type_version.clone(),
        }
    }
}
