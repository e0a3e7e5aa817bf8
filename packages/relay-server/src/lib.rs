//! Blind relay server: wires `relay-core`'s entity store, auth resolver,
//! connection registry, and relay engine into axum's HTTP and WebSocket
//! surfaces, plus the ambient stack (config, retention sweeper) a deployable
//! service needs around that core.

pub mod config;
pub mod error;
pub mod http;
pub mod state;
pub mod sweeper;
pub mod ws;

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;

pub use error::ApiError;
pub use state::AppState;

/// Offload a blocking store/auth call onto a blocking-pool thread so the
/// cooperative runtime never stalls on a database call. Panics in `f`
/// propagate as a task panic, matching
/// `tokio::task::spawn_blocking`'s own contract.
pub async fn blocking<F, T, E>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking task panicked")
}

/// Extract the bearer API token from either `Authorization: Bearer <token>`
/// or `X-API-Token: <token>`.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("X-API-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Build the full router: HTTP push/pull/device-management surface plus the
/// device and client WebSocket endpoints.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/push", post(http::push))
        .route("/api/pull", post(http::pull))
        .route("/api/register_device", post(http::register_device))
        .route("/api/delete_device", post(http::delete_device))
        .route("/api/devices", get(http::list_devices))
        .route("/api/stats", get(http::stats))
        .route("/api/health", get(http::health))
        .route("/ws/client/:client_id", get(ws::client_ws_handler))
        .route("/ws/:device_id", get(ws::device_ws_handler))
        .with_state(state)
}
