//! Sensor aggregate and per-node status records.
//!
//! These types are the persisted shape of a sensor: the declared spec plus
//! the status map that the state machine mutates.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::event::Event;

use super::trigger::TriggerSpec;

/// Maximum length of a sensor, signal or trigger name.
pub const MAX_NAME_LEN: usize = 63;

/// Phase of a node or of the sensor as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    New,
    Active,
    Complete,
    Error,
}

impl NodePhase {
    /// Complete and Error are terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Active => "Active",
            Self::Complete => "Complete",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a node tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Signal,
    Trigger,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => f.write_str("Signal"),
            Self::Trigger => f.write_str("Trigger"),
        }
    }
}

/// Deterministic node identifier, stable across updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Derives the id of node `node_name` inside sensor `sensor_name`.
    #[must_use]
    pub fn derive(sensor_name: &str, node_name: &str) -> Self {
        let hash = blake3::hash(node_name.as_bytes());
        let hex = hash.to_hex();
        Self(format!("{sensor_name}-{}", &hex.as_str()[..16]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The latest event observed by a signal node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: Event,
    /// Set once the trigger path has consumed the event.
    pub seen: bool,
}

/// Status of one declared signal or trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set once, the first time the node reaches a terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_event: Option<EventRecord>,
}

impl NodeStatus {
    #[must_use]
    pub fn new(id: NodeId, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            phase: NodePhase::New,
            message: String::new(),
            started_at: None,
            completed_at: None,
            latest_event: None,
        }
    }
}

/// A declared signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSpec {
    /// Must equal the `source` of events that satisfy this signal.
    pub name: String,
}

impl SignalSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Declared configuration of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    /// Signals, in declared order.
    pub signals: Vec<SignalSpec>,
    /// Triggers, executed in declared order.
    pub triggers: Vec<TriggerSpec>,
    /// Re-arm the signals after every successful pass.
    #[serde(default)]
    pub repeat: bool,
}

fn name_regex() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").unwrap_or_else(|_| unreachable!())
    })
}

/// Validates a DNS-1123 style name.
pub fn validate_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::MissingField {
            field: format!("{field}.name"),
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::InvalidName {
            field: field.to_string(),
            name: name.to_string(),
            reason: format!("must be at most {MAX_NAME_LEN} characters"),
        });
    }
    if !name_regex().is_match(name) {
        return Err(ValidationError::InvalidName {
            field: field.to_string(),
            name: name.to_string(),
            reason: "must consist of lower case alphanumerics, '-' or '.'".to_string(),
        });
    }
    Ok(())
}

impl SensorSpec {
    /// Validates names and counts before the sensor is reconciled.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.signals.is_empty() {
            return Err(ValidationError::MissingField {
                field: "signals".to_string(),
            });
        }
        if self.triggers.is_empty() {
            return Err(ValidationError::MissingField {
                field: "triggers".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for signal in &self.signals {
            validate_name("signal", &signal.name)?;
            if !seen.insert(signal.name.as_str()) {
                return Err(ValidationError::DuplicateName {
                    field: "signal".to_string(),
                    name: signal.name.clone(),
                });
            }
        }

        // Signal and trigger nodes share one id space.
        for trigger in &self.triggers {
            validate_name("trigger", &trigger.name)?;
            if !seen.insert(trigger.name.as_str()) {
                return Err(ValidationError::DuplicateName {
                    field: "trigger".to_string(),
                    name: trigger.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Returns true if `name` is a declared signal.
    #[must_use]
    pub fn declares_signal(&self, name: &str) -> bool {
        self.signals.iter().any(|s| s.name == name)
    }
}

/// Persisted status of a sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorStatus {
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeStatus>,
}

/// Namespaced sensor identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorKey {
    pub namespace: String,
    pub name: String,
}

impl SensorKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Sensor aggregate root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub name: String,
    pub namespace: String,
    pub spec: SensorSpec,
    #[serde(default)]
    pub status: SensorStatus,
}

impl Sensor {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: SensorSpec) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            spec,
            status: SensorStatus::default(),
        }
    }

    #[must_use]
    pub fn key(&self) -> SensorKey {
        SensorKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Id of the node for signal or trigger `name`.
    #[must_use]
    pub fn node_id(&self, name: &str) -> NodeId {
        NodeId::derive(&self.name, name)
    }

    /// Node for signal or trigger `name`, if initialized.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.status.nodes.get(&self.node_id(name))
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut NodeStatus> {
        let id = self.node_id(name);
        self.status.nodes.get_mut(&id)
    }

    /// Iterates the nodes of `kind`.
    pub fn nodes_of(&self, kind: NodeKind) -> impl Iterator<Item = &NodeStatus> {
        self.status.nodes.values().filter(move |n| n.kind == kind)
    }
}
