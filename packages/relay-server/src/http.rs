//! HTTP push/pull surface. Every route here is the
//! out-of-stream counterpart to the WebSocket surface in `ws.rs` — both end
//! up calling the same `relay_core::RelayEngine`.

use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use relay_core::{
    store, AuthResolver, Direction, MessageType, OuterEnvelope, StoreError, User,
};

use crate::{blocking, extract_token, ApiError, AppState};

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = extract_token(headers);
    let pool = state.pool.clone();
    blocking(move || AuthResolver::resolve_token(&pool, token.as_deref())).await
        .map_err(ApiError::from)
}

fn default_version() -> String {
    "1.0".to_string()
}

// --- push ---

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub payload: String,
    pub signature: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_to_device")]
    pub direction: String,
}

fn default_to_device() -> String {
    "to_device".to_string()
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    status: &'static str,
    device_id: String,
    delivered_via_ws: bool,
}

/// `POST /api/push`. Always persists the envelope durably before attempting
/// immediate delivery — documented at-least-once delivery: a device that is
/// connected and later pulls over HTTP may legitimately see it twice;
/// endpoints deduplicate via
/// `request_counter`.
pub async fn push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    if req.version != "1.0" {
        return Err(ApiError::UnsupportedVersion);
    }
    let direction = Direction::parse(&req.direction).unwrap_or(Direction::ToDevice);

    let pool = state.pool.clone();
    let device_id = req.device_id.clone();
    let user_id = user.id.clone();
    let device = blocking(move || store::find_device_owned_by(&pool, &device_id, &user_id))
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::DeviceNotFound)?;

    let pool = state.pool.clone();
    let device_id = device.device_id.clone();
    blocking(move || store::touch_device_last_seen(&pool, &device_id))
        .await
        .map_err(ApiError::from)?;

    let pool = state.pool.clone();
    let engine = state.engine.clone();
    let device_id = device.device_id.clone();
    let device_token = device.device_token.clone();
    let payload = req.payload.clone();
    let signature = req.signature.clone();
    blocking(move || {
        engine.enqueue_durable(&pool, direction, &device_id, Some(&device_token), &payload, &signature)
    })
    .await
    .map_err(ApiError::from)?;

    let envelope = OuterEnvelope {
        device_id: req.device_id.clone(),
        payload: req.payload,
        signature: req.signature,
        version: req.version,
        request_counter: None,
    };

    let delivered = state
        .engine
        .deliver(&req.device_id, envelope, None)
        .map_err(ApiError::from)?
        .delivered();

    Ok(Json(PushResponse {
        status: "ok",
        device_id: req.device_id,
        delivered_via_ws: delivered,
    }))
}

// --- pull ---

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub device_id: String,
    #[serde(default = "default_to_client")]
    pub direction: String,
    #[serde(default)]
    pub wait: i64,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_to_client() -> String {
    "to_client".to_string()
}

#[derive(Debug, Serialize)]
pub struct PulledEnvelope {
    pub device_id: String,
    pub message_type: MessageType,
    pub packet: String,
    pub payload: String,
    pub signature: String,
    pub direction: Direction,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct PullResponse {
    status: &'static str,
    device_id: String,
    messages: Vec<PulledEnvelope>,
    count: usize,
}

/// `POST /api/pull`. Destructive read: envelopes are returned and deleted in
/// the same pass. `wait` long-polls in 100 ms slices up to `min(wait, 30)`
/// seconds.
pub async fn pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PullRequest>,
) -> Result<Json<PullResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    if req.version != "1.0" {
        return Err(ApiError::UnsupportedVersion);
    }
    let direction = Direction::parse(&req.direction).unwrap_or(Direction::ToClient);

    let pool = state.pool.clone();
    let device_id = req.device_id.clone();
    let user_id = user.id.clone();
    blocking(move || store::find_device_owned_by(&pool, &device_id, &user_id))
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::DeviceNotFound)?;

    let pool = state.pool.clone();
    let device_id = req.device_id.clone();
    blocking(move || store::touch_device_last_seen(&pool, &device_id))
        .await
        .map_err(ApiError::from)?;

    let wait_secs = req.wait.clamp(0, 30) as u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);

    let envelopes = loop {
        let pool = state.pool.clone();
        let device_id = req.device_id.clone();
        let envelopes = blocking(move || store::list_envelopes(&pool, &device_id, direction))
            .await
            .map_err(ApiError::from)?;

        if !envelopes.is_empty() || wait_secs == 0 {
            break envelopes;
        }
        if tokio::time::Instant::now() >= deadline {
            break envelopes;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    if !envelopes.is_empty() {
        let pool = state.pool.clone();
        let device_id = req.device_id.clone();
        blocking(move || store::increment_poll_count(&pool, &device_id))
            .await
            .map_err(ApiError::from)?;
    }

    let ids: Vec<i64> = envelopes.iter().map(|e| e.id).collect();
    let pool = state.pool.clone();
    blocking(move || store::delete_envelopes(&pool, &ids))
        .await
        .map_err(ApiError::from)?;

    let count = envelopes.len();
    let messages = envelopes
        .into_iter()
        .map(|e| PulledEnvelope {
            device_id: e.device_id,
            message_type: e.message_type,
            packet: e.message_data.clone(),
            payload: e.message_data,
            signature: e.signature.unwrap_or_default(),
            direction: e.direction,
            timestamp: e.timestamp,
        })
        .collect();

    Ok(Json(PullResponse {
        status: "ok",
        device_id: req.device_id,
        messages,
        count,
    }))
}

// --- device management ---

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    #[serde(default)]
    pub device_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct RegisterDeviceResponse {
    status: &'static str,
    device_id: String,
    device_token: String,
    mode: &'static str,
}

/// `POST /api/register_device`. Creates or updates a device row; `mode` is
/// always `"cloud"` — this relay has no LAN-discovery peer mode.
pub async fn register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<RegisterDeviceResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let device_token = req
        .device_data
        .as_ref()
        .and_then(|data| data.get("device_token"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let pool = state.pool.clone();
    let device_id = req.device_id.clone();
    let device = blocking(move || store::upsert_device(&pool, &user, &device_id, device_token))
        .await
        .map_err(|err| match err {
            StoreError::DeviceLimitExceeded(n) => ApiError::LimitExceeded(n),
            other => ApiError::Store(other),
        })?;

    Ok(Json(RegisterDeviceResponse {
        status: "ok",
        device_id: device.device_id,
        device_token: device.device_token,
        mode: "cloud",
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteDeviceRequest {
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteDeviceResponse {
    status: &'static str,
    message: String,
}

/// `POST /api/delete_device`. Cascades envelope deletion and tears down any
/// live stream for the device.
pub async fn delete_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeleteDeviceRequest>,
) -> Result<Json<DeleteDeviceResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let pool = state.pool.clone();
    let device_id = req.device_id.clone();
    let user_id = user.id.clone();
    let deleted = blocking(move || store::delete_device(&pool, &device_id, &user_id))
        .await
        .map_err(ApiError::from)?;

    if !deleted {
        return Err(ApiError::DeviceNotFound);
    }

    state.registry.remove(&req.device_id);

    Ok(Json(DeleteDeviceResponse {
        status: "ok",
        message: format!("device {} deleted", req.device_id),
    }))
}

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    device_id: String,
    cloud: bool,
    online: bool,
    last_seen: Option<i64>,
    poll_count: i64,
    added: i64,
}

#[derive(Debug, Serialize)]
pub struct UserDevicesResponse {
    user: String,
    plan: String,
    devices_limit: i64,
    devices_count: usize,
    devices: Vec<DeviceInfo>,
}

/// `GET /api/devices`. Presence combines live-stream registration with the
/// `last_seen` window.
pub async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserDevicesResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let pool = state.pool.clone();
    let user_id = user.id.clone();
    let devices = blocking(move || store::list_devices_for_user(&pool, &user_id))
        .await
        .map_err(ApiError::from)?;

    let now = chrono::Utc::now().timestamp();
    let registry = state.registry.clone();
    let devices: Vec<DeviceInfo> = devices
        .into_iter()
        .map(|d| {
            let online = registry.is_present(&d.device_id) || d.seen_recently(now);
            DeviceInfo {
                device_id: d.device_id,
                cloud: d.cloud,
                online,
                last_seen: d.last_seen,
                poll_count: d.poll_count,
                added: d.added,
            }
        })
        .collect();

    Ok(Json(UserDevicesResponse {
        user: user.username,
        plan: user.plan,
        devices_limit: user.devices_limit,
        devices_count: devices.len(),
        devices,
    }))
}

// --- operational ---

/// `GET /api/stats`. No auth — operational surface.
pub async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.pool.clone();
    let (online, total, users, to_device, to_client) = blocking(move || {
        Ok::<_, StoreError>((
            store::count_online_devices(&pool)?,
            store::count_devices(&pool)?,
            store::count_users(&pool)?,
            store::count_envelopes_by_direction(&pool, Direction::ToDevice)?,
            store::count_envelopes_by_direction(&pool, Direction::ToClient)?,
        ))
    })
    .await
    .map_err(ApiError::from)?;

    Ok(Json(json!({
        "online_devices": online,
        "total_devices": total,
        "total_users": users,
        "queues_to_device": to_device,
        "queues_to_client": to_client,
        "total_queues": to_device + to_client,
        "websocket_connections": state.registry.connection_count(),
        "server_time": chrono::Utc::now().to_rfc3339(),
        "status": "running",
    })))
}

/// `GET /api/health`. No auth.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "WakeLink Cloud Relay",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "websockets": state.registry.connection_count(),
    }))
}
