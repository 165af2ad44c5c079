//! HTTP push delivery.
//!
//! Gateways POST a JSON event to any path. Validation failures are logged
//! and answered with `200 OK` and an empty body: delivery is fire-and-forget
//! and retries are the producer's business.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

use crate::error::ValidationError;
use crate::event::Event;
use crate::sensor::{NotificationOutcome, SensorRuntime, Shutdown};

/// Router accepting pushed events for `runtime`.
pub fn push_router(runtime: Arc<SensorRuntime>) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/*path", post(receive))
        .with_state(runtime)
}

async fn receive(State(runtime): State<Arc<SensorRuntime>>, body: Bytes) -> StatusCode {
    let event: Event = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            let err = ValidationError::MalformedNotification {
                reason: e.to_string(),
            };
            warn!(sensor = %runtime.key(), error = %err, "dropping notification");
            return StatusCode::OK;
        }
    };

    let handler = Arc::clone(&runtime);
    match tokio::task::spawn_blocking(move || handler.handle_notification(event)).await {
        Ok(Ok(outcome)) => {
            if !matches!(outcome, NotificationOutcome::Dropped(_)) {
                debug!(sensor = %runtime.key(), ?outcome, "notification handled");
            }
            StatusCode::OK
        }
        Ok(Err(e)) if e.is_retryable() => {
            warn!(sensor = %runtime.key(), error = %e, "notification not persisted");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Ok(Err(e)) => {
            error!(sensor = %runtime.key(), error = %e, "notification handling failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(e) => {
            error!(sensor = %runtime.key(), error = %e, "notification handler panicked");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Serves [`push_router`] on `listener` until `shutdown` fires.
pub async fn serve_push(
    listener: TcpListener,
    runtime: Arc<SensorRuntime>,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    axum::serve(listener, push_router(runtime))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
