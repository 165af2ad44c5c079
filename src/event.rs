//! Normalized event envelope.
//!
//! Events follow the CloudEvents v0.1 context attributes. The payload is
//! carried as opaque bytes next to the context and is only interpreted
//! when a trigger consumes it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// The CloudEvents specification version produced by this crate.
pub const CLOUD_EVENTS_VERSION: &str = "0.1";

/// JSON media type.
pub const MEDIA_TYPE_JSON: &str = "application/json";

/// YAML media type.
pub const MEDIA_TYPE_YAML: &str = "application/yaml";

/// Standard metadata about an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// The version of the CloudEvents specification used by the event.
    #[serde(default)]
    pub cloud_events_version: String,
    /// Unique within the scope of the producer.
    #[serde(rename = "eventID")]
    pub event_id: String,
    /// When the event was produced.
    pub event_time: DateTime<Utc>,
    /// Type of occurrence which has happened.
    pub event_type: String,
    /// Producer-specific version of `event_type`.
    #[serde(default)]
    pub event_type_version: String,
    /// A link to the schema that the payload adheres to.
    #[serde(rename = "schemaURL", default, skip_serializing_if = "Option::is_none")]
    pub schema_url: Option<String>,
    /// Media type of the payload, copied from the inbound request.
    #[serde(default)]
    pub content_type: String,
    /// Producer identity. Matched against a sensor's signal names.
    pub source: String,
    /// Additional metadata without a well-defined structure.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl EventContext {
    /// Creates a context with a fresh event id stamped with the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        event_type_version: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            cloud_events_version: CLOUD_EVENTS_VERSION.to_string(),
            event_id: new_event_id(),
            event_time: Utc::now(),
            event_type: event_type.into(),
            event_type_version: event_type_version.into(),
            schema_url: None,
            content_type: content_type.into(),
            source: source.into(),
            extensions: BTreeMap::new(),
        }
    }
}

/// An immutable event: context metadata plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub context: EventContext,
    #[serde(default, with = "payload_base64")]
    pub payload: Vec<u8>,
}

impl Event {
    #[must_use]
    pub fn new(context: EventContext, payload: Vec<u8>) -> Self {
        Self { context, payload }
    }

    /// The event id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.context.event_id
    }

    /// The producer identity used for signal matching.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.context.source
    }

    /// Interprets the payload according to its content type and renders it as JSON.
    ///
    /// JSON payloads are validated, YAML payloads are converted. Any other
    /// content type fails with `UnsupportedContentType`.
    pub fn payload_as_json(&self) -> Result<serde_json::Value, ValidationError> {
        match ContentType::parse(&self.context.content_type)? {
            ContentType::Json => serde_json::from_slice(&self.payload).map_err(|e| {
                ValidationError::InvalidPayload {
                    reason: format!("event data is not valid JSON: {e}"),
                }
            }),
            ContentType::Yaml => serde_yaml::from_slice(&self.payload).map_err(|e| {
                ValidationError::InvalidPayload {
                    reason: format!("failed converting YAML event data to JSON: {e}"),
                }
            }),
        }
    }
}

/// Supported payload media types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Json,
    Yaml,
}

impl ContentType {
    /// Parses a content type header value. Parameters such as `charset` are ignored.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let media = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match media.as_str() {
            MEDIA_TYPE_JSON => Ok(Self::Json),
            MEDIA_TYPE_YAML | "application/x-yaml" | "text/yaml" => Ok(Self::Yaml),
            _ => Err(ValidationError::UnsupportedContentType {
                content_type: value.to_string(),
            }),
        }
    }

    /// Canonical media type string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => MEDIA_TYPE_JSON,
            Self::Yaml => MEDIA_TYPE_YAML,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates a unique event id (hex-encoded UUIDv4).
#[must_use]
pub fn new_event_id() -> String {
    Uuid::new_v4().simple().to_string()
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
