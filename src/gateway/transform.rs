//! Inbound HTTP request to [`Event`] conversion.

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Request};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::event::{Event, EventContext};

/// Largest request body the transformer reads.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Static identity stamped onto every event a gateway produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Producer identity; sensors match it against their signal names.
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub event_type_version: String,
}

/// Builds normalized events from raw requests. Payloads are never inspected.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    config: TransformerConfig,
    max_payload_bytes: usize,
}

impl EventTransformer {
    #[must_use]
    pub fn new(config: TransformerConfig) -> Self {
        Self {
            config,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }

    #[must_use]
    pub const fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Wraps `payload` in a fresh event, copying the request content type.
    #[must_use]
    pub fn transform(&self, headers: &HeaderMap, payload: Vec<u8>) -> Event {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Event::new(
            EventContext::new(
                self.config.source.clone(),
                self.config.event_type.clone(),
                self.config.event_type_version.clone(),
                content_type,
            ),
            payload,
        )
    }

    /// Reads the whole body of `request` and transforms it.
    pub async fn transform_request(&self, request: Request<Body>) -> Result<Event, TransportError> {
        let (parts, body) = request.into_parts();
        let payload = axum::body::to_bytes(body, self.max_payload_bytes)
            .await
            .map_err(|e| TransportError::PayloadReadError {
                message: e.to_string(),
            })?;
        Ok(self.transform(&parts.headers, payload.to_vec()))
    }
}
