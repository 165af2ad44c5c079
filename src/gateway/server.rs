//! Gateway intake HTTP server.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::sensor::Shutdown;

use super::Gateway;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Router running transform and dispatch for every POST, on any path.
pub fn gateway_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/", post(intake))
        .route("/*path", post(intake))
        .with_state(gateway)
}

async fn intake(State(gateway): State<Gateway>, request: Request<Body>) -> Response {
    match gateway.handle(request).await {
        Ok(report) if report.is_success() => (StatusCode::OK, Json(report)).into_response(),
        Ok(report) => (StatusCode::BAD_GATEWAY, Json(report)).into_response(),
        Err(e) => {
            warn!(gateway = %gateway.name(), error = %e, "rejecting inbound request");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Serves [`gateway_router`] on `listener` until `shutdown` fires.
pub async fn serve_gateway(
    listener: TcpListener,
    gateway: Gateway,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    axum::serve(listener, gateway_router(gateway))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
