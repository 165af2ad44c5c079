//! Trigger declarations and the executor boundary.
//!
//! The sensor core only knows the [`TriggerExecutor`] trait. What a trigger
//! does is up to the executor; [`DefaultTriggerExecutor`] covers the two
//! built-in templates.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

use crate::event::{Event, EventContext};

use super::types::SensorKey;

/// A declared trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    pub template: TriggerTemplate,
}

impl TriggerSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, template: TriggerTemplate) -> Self {
        Self {
            name: name.into(),
            template,
        }
    }
}

/// What to do when a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerTemplate {
    /// POST the consumed signal events to `url`.
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },

    /// Emit a log line.
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Input handed to a trigger executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub sensor: SensorKey,
    /// Latest event per signal name.
    pub events: BTreeMap<String, Event>,
}

/// A trigger invocation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TriggerError {
    pub message: String,
}

impl TriggerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes a single trigger.
///
/// Called from a blocking context; implementations may block.
pub trait TriggerExecutor: Send + Sync {
    fn execute(&self, trigger: &TriggerSpec, ctx: &TriggerContext) -> Result<(), TriggerError>;
}

/// Body POSTed by webhook triggers.
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    sensor: &'a SensorKey,
    trigger: &'a str,
    events: BTreeMap<&'a str, RenderedEvent<'a>>,
}

/// An event with its payload decoded according to its content type.
#[derive(Debug, Serialize)]
struct RenderedEvent<'a> {
    context: &'a EventContext,
    payload: serde_json::Value,
}

/// Decodes every payload, failing on the first one that cannot be rendered.
fn render_events(
    events: &BTreeMap<String, Event>,
) -> Result<BTreeMap<&str, RenderedEvent<'_>>, TriggerError> {
    events
        .iter()
        .map(|(signal, event)| {
            let payload = event.payload_as_json().map_err(|e| {
                TriggerError::new(format!("signal '{signal}' payload cannot be rendered: {e}"))
            })?;
            Ok((
                signal.as_str(),
                RenderedEvent {
                    context: &event.context,
                    payload,
                },
            ))
        })
        .collect()
}

/// Executor for the built-in trigger templates.
///
/// Webhook calls are driven on `handle`, so `execute` must be called from a
/// thread that is not itself running async tasks (a `spawn_blocking` pool
/// thread or a plain thread).
#[derive(Debug, Clone)]
pub struct DefaultTriggerExecutor {
    client: reqwest::Client,
    handle: Handle,
}

impl DefaultTriggerExecutor {
    /// Default timeout for webhook calls.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new(client: reqwest::Client, handle: Handle) -> Self {
        Self { client, handle }
    }

    /// Builds an executor with a default client bound to the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_current() -> Result<Self, TriggerError> {
        let handle = Handle::try_current()
            .map_err(|e| TriggerError::new(format!("no tokio runtime: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| TriggerError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::new(client, handle))
    }

    async fn call_webhook(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &WebhookBody<'_>,
    ) -> Result<(), TriggerError> {
        let mut request = self.client.post(url).json(body);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TriggerError::new(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TriggerError::new(format!("HTTP {status}")))
        }
    }
}

impl TriggerExecutor for DefaultTriggerExecutor {
    fn execute(&self, trigger: &TriggerSpec, ctx: &TriggerContext) -> Result<(), TriggerError> {
        match &trigger.template {
            TriggerTemplate::Webhook { url, headers } => {
                let body = WebhookBody {
                    sensor: &ctx.sensor,
                    trigger: &trigger.name,
                    events: render_events(&ctx.events)?,
                };
                self.handle.block_on(self.call_webhook(url, headers, &body))
            }
            TriggerTemplate::Log { message } => {
                info!(
                    sensor = %ctx.sensor,
                    trigger = %trigger.name,
                    events = ctx.events.len(),
                    message = message.as_deref().unwrap_or(""),
                    "trigger fired"
                );
                Ok(())
            }
        }
    }
}
