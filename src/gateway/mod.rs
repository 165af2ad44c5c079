//! Gateway side: turn inbound requests into events and deliver them.
//!
//! ```text
//! request -> EventTransformer -> EventDispatcher -> SensorResolver -> POST sensor
//! ```

mod dispatcher;
mod resolver;
mod server;
mod transform;

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use tracing::info;

use crate::error::TransportError;

pub use dispatcher::{DispatchReport, EventDispatcher};
pub use resolver::{
    DnsServiceRegistry, SensorResolver, ServiceRegistry, StaticServiceRegistry,
    SENSOR_SERVICE_PORT,
};
pub use server::{gateway_router, serve_gateway};
pub use transform::{EventTransformer, TransformerConfig, MAX_PAYLOAD_BYTES};

/// A configured gateway: one transformer feeding one dispatcher.
#[derive(Debug, Clone)]
pub struct Gateway {
    name: Arc<str>,
    transformer: Arc<EventTransformer>,
    dispatcher: Arc<EventDispatcher>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        transformer: EventTransformer,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            transformer: Arc::new(transformer),
            dispatcher: Arc::new(dispatcher),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn transformer(&self) -> &EventTransformer {
        &self.transformer
    }

    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Transforms `request` and dispatches the event to every target.
    pub async fn handle(&self, request: Request<Body>) -> Result<DispatchReport, TransportError> {
        let event = self.transformer.transform_request(request).await?;
        let report = self.dispatcher.dispatch(&event).await;
        info!(
            gateway = %self.name,
            event_id = %report.event_id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "event dispatched"
        );
        Ok(report)
    }
}
