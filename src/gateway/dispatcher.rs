//! Fan-out delivery of events to target sensors.

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::event::Event;

use super::resolver::SensorResolver;

/// Outcome of delivering one event to every target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub event_id: String,
    /// Targets that accepted the event.
    pub delivered: Vec<String>,
    pub failed: Vec<DispatchError>,
}

impl DispatchReport {
    /// True when every target accepted the event.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// POSTs events to the sensors named in the gateway configuration.
///
/// Targets are independent: one failed delivery never holds up another.
/// There is no retry here; the caller decides whether to re-run the whole
/// transform-and-dispatch cycle.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    client: reqwest::Client,
    resolver: SensorResolver,
    targets: Vec<String>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(client: reqwest::Client, resolver: SensorResolver, targets: Vec<String>) -> Self {
        Self {
            client,
            resolver,
            targets,
        }
    }

    #[must_use]
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Delivers `event` to every target concurrently.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let results = join_all(
            self.targets
                .iter()
                .map(|target| async move { (target, self.deliver(target, event).await) }),
        )
        .await;

        let mut report = DispatchReport {
            event_id: event.id().to_string(),
            ..DispatchReport::default()
        };
        for (target, result) in results {
            match result {
                Ok(()) => report.delivered.push(target.clone()),
                Err(e) => {
                    warn!(sensor = %target, event_id = %event.id(), error = %e.cause, "failed to dispatch event");
                    report.failed.push(e);
                }
            }
        }
        report
    }

    async fn deliver(&self, target: &str, event: &Event) -> Result<(), DispatchError> {
        let address = self
            .resolver
            .resolve(target)
            .await
            .map_err(|e| DispatchError::new(target, e.to_string()))?;
        let url = format!("http://{address}/");

        let response = self
            .client
            .post(&url)
            .json(event)
            .send()
            .await
            .map_err(|e| DispatchError::new(target, format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::new(target, format!("HTTP {status}")));
        }
        debug!(sensor = %target, %url, event_id = %event.id(), "event dispatched");
        Ok(())
    }
}
