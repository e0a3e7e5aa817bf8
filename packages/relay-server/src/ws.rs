//! Push-stream surface. Two endpoint families
//! (`/ws/{device_id}`, `/ws/client/{client_id}`) share one state machine,
//! INIT → AUTHENTICATED → ACTIVE → CLOSED, built on axum's `WebSocketUpgrade`
//! the way `other_examples`' relay crate splits a socket into a read loop
//! plus a channel-fed forward task — generalized here so both relay-pushed
//! envelopes and locally-built welcome/error/ack frames share one forwarder.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use relay_core::{AuthResolver, Direction, OuterEnvelope};

use crate::{blocking, extract_token, AppState};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const POLICY_VIOLATION: u16 = 1008;

/// Either a relayed envelope or a frame the stream handler builds itself
/// (welcome/error/ack). One channel, one forwarder task, so ordering between
/// relay traffic and local replies is never racing two sinks.
enum OutgoingFrame {
    Envelope(OuterEnvelope),
    Raw(Value),
}

struct WsSink {
    tx: mpsc::UnboundedSender<OutgoingFrame>,
    forward_task: tokio::task::AbortHandle,
}

impl relay_core::DeliverySink for WsSink {
    fn send(&self, envelope: &OuterEnvelope) -> bool {
        self.tx.send(OutgoingFrame::Envelope(envelope.clone())).is_ok()
    }

    /// Called when a newer registration under the same connection id
    /// displaces this one, or the connection is force-removed. Aborting the
    /// forwarder task drops its `SplitSink`, tearing down the write half of
    /// the displaced socket so a stale connection goes quiet rather than
    /// silently shadowing the live one.
    fn close(&self) {
        self.forward_task.abort();
    }
}

async fn send_raw(sink: &mut futures_util::stream::SplitSink<WebSocket, Message>, value: Value) {
    let _ = sink.send(Message::Text(value.to_string())).await;
}

async fn close_with(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Required-field extraction for an inbound outer envelope. Distinguishes
/// "not JSON" from "JSON but missing fields", matching the two distinct wire
/// error kinds the original server sends.
struct Packet {
    device_id: String,
    payload: String,
    signature: String,
    version: String,
    request_counter: Option<i64>,
}

enum PacketError {
    InvalidJson,
    MissingFields(Vec<&'static str>),
}

fn parse_packet(text: &str) -> Result<Packet, PacketError> {
    let value: Value = serde_json::from_str(text).map_err(|_| PacketError::InvalidJson)?;
    let obj = value.as_object().ok_or(PacketError::InvalidJson)?;

    let mut missing = Vec::new();
    for field in ["device_id", "payload", "signature", "version"] {
        if !obj.contains_key(field) {
            missing.push(field);
        }
    }
    if !missing.is_empty() {
        return Err(PacketError::MissingFields(missing));
    }

    let as_str = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or("").to_string();
    Ok(Packet {
        device_id: as_str("device_id"),
        payload: as_str("payload"),
        signature: as_str("signature"),
        version: as_str("version"),
        request_counter: obj.get("request_counter").and_then(Value::as_i64),
    })
}

// --- device stream ---

pub async fn device_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = extract_token(&headers);
    ws.on_upgrade(move |socket| handle_device_socket(socket, state, device_id, token))
}

async fn handle_device_socket(
    socket: WebSocket,
    state: AppState,
    device_id: String,
    token: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();

    let Some(token) = token else {
        send_raw(
            &mut sink,
            json!({
                "status": "error",
                "error": "AUTH_REQUIRED",
                "message": "Authorization header with Bearer token is required",
            }),
        )
        .await;
        close_with(&mut sink, POLICY_VIOLATION, "missing Authorization header").await;
        return;
    };

    let pool = state.pool.clone();
    let user = match blocking(move || AuthResolver::resolve_token(&pool, Some(&token))).await {
        Ok(user) => user,
        Err(_) => {
            send_raw(
                &mut sink,
                json!({"status": "error", "error": "INVALID_API_TOKEN", "message": "Invalid API token"}),
            )
            .await;
            close_with(&mut sink, POLICY_VIOLATION, "invalid API token").await;
            return;
        }
    };

    let pool = state.pool.clone();
    let device_id_for_lookup = device_id.clone();
    let device = match blocking(move || AuthResolver::resolve_owned_device(&pool, &user, &device_id_for_lookup)).await {
        Ok(device) => device,
        Err(_) => {
            send_raw(
                &mut sink,
                json!({
                    "status": "error",
                    "error": "DEVICE_NOT_FOUND",
                    "message": format!("Device {device_id} not found or not owned by user"),
                }),
            )
            .await;
            close_with(&mut sink, POLICY_VIOLATION, "device not found").await;
            return;
        }
    };

    let pool = state.pool.clone();
    let touch_id = device_id.clone();
    let _ = blocking(move || relay_core::store::touch_device_last_seen(&pool, &touch_id)).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingFrame>();
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame {
                OutgoingFrame::Envelope(envelope) => serde_json::to_string(&envelope).unwrap_or_default(),
                OutgoingFrame::Raw(value) => value.to_string(),
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });
    let epoch = state.registry.register(
        &device_id,
        Box::new(WsSink { tx: tx.clone(), forward_task: forward_task.abort_handle() }),
    );
    tracing::info!(device_id = %device_id, "device stream authenticated");

    let _ = tx.send(OutgoingFrame::Raw(json!({
        "type": "welcome",
        "status": "connected",
        "device_id": device_id,
        "protocol_version": "1.0",
        "message": "WebSocket connection established",
    })));

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                handle_device_frame(&state, &device, &device_id, &text, &tx).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.deregister(&device_id, epoch);
    forward_task.abort();
    tracing::info!(device_id = %device_id, "device stream disconnected");
}

async fn handle_device_frame(
    state: &AppState,
    device: &relay_core::Device,
    connecting_device_id: &str,
    text: &str,
    tx: &mpsc::UnboundedSender<OutgoingFrame>,
) {
    let packet = match parse_packet(text) {
        Ok(packet) => packet,
        Err(PacketError::InvalidJson) => {
            let _ = tx.send(OutgoingFrame::Raw(json!({
                "status": "error",
                "error": "INVALID_JSON",
                "message": "Failed to parse JSON",
            })));
            return;
        }
        Err(PacketError::MissingFields(fields)) => {
            let _ = tx.send(OutgoingFrame::Raw(json!({
                "status": "error",
                "error": "INVALID_PACKET",
                "message": format!("Missing fields: {fields:?}"),
            })));
            return;
        }
    };

    if packet.version != "1.0" {
        let _ = tx.send(OutgoingFrame::Raw(json!({
            "status": "error",
            "error": "UNSUPPORTED_VERSION",
            "message": "Protocol version must be 1.0",
        })));
        return;
    }

    let pool = state.pool.clone();
    let target_device_id = packet.device_id.clone();
    let counter = packet.request_counter;
    let _ = blocking(move || {
        relay_core::store::touch_device_last_seen(&pool, &target_device_id)?;
        if let Some(counter) = counter {
            relay_core::store::bump_request_counter(&pool, &target_device_id, counter)?;
        }
        Ok::<_, relay_core::StoreError>(())
    })
    .await;

    let envelope = OuterEnvelope {
        device_id: packet.device_id.clone(),
        payload: packet.payload.clone(),
        signature: packet.signature.clone(),
        version: "1.0".to_string(),
        request_counter: packet.request_counter,
    };

    let forwarded = state.engine.deliver_response(connecting_device_id, &envelope);
    if forwarded {
        tracing::info!(device_id = %connecting_device_id, "response forwarded to waiting client");
    } else {
        let pool = state.pool.clone();
        let device_token = device.device_token.clone();
        let _ = blocking(move || {
            relay_core::store::insert_envelope(
                &pool,
                &packet.device_id,
                Some(&device_token),
                &packet.payload,
                Some(&packet.signature),
                Direction::ToClient,
            )
        })
        .await;
        tracing::info!(device_id = %connecting_device_id, "response queued for HTTP pull");
    }
}

// --- client stream ---

pub async fn client_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, client_id))
}

async fn handle_client_socket(socket: WebSocket, state: AppState, client_id: String) {
    let (mut sink, mut stream) = socket.split();

    let first = tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await;
    let token = match first {
        Ok(Some(Ok(Message::Text(text)))) => {
            let value: Option<Value> = serde_json::from_str(&text).ok();
            value
                .filter(|v| v.get("type").and_then(Value::as_str) == Some("auth"))
                .and_then(|v| v.get("token").and_then(Value::as_str).map(str::to_string))
        }
        _ => None,
    };

    let Some(token) = token else {
        send_raw(
            &mut sink,
            json!({
                "status": "error",
                "error": "AUTH_REQUIRED",
                "message": "Authentication required. Send: {\"type\": \"auth\", \"token\": \"<api_token>\"}",
            }),
        )
        .await;
        close_with(&mut sink, POLICY_VIOLATION, "auth required").await;
        return;
    };

    let pool = state.pool.clone();
    let user = match blocking(move || AuthResolver::resolve_token(&pool, Some(&token))).await {
        Ok(user) => user,
        Err(_) => {
            send_raw(
                &mut sink,
                json!({"status": "error", "error": "INVALID_TOKEN", "message": "Invalid API token"}),
            )
            .await;
            close_with(&mut sink, POLICY_VIOLATION, "invalid token").await;
            return;
        }
    };

    let connection_id = format!("client_{client_id}");
    let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingFrame>();
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame {
                OutgoingFrame::Envelope(envelope) => serde_json::to_string(&envelope).unwrap_or_default(),
                OutgoingFrame::Raw(value) => value.to_string(),
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });
    let epoch = state.registry.register(
        &connection_id,
        Box::new(WsSink { tx: tx.clone(), forward_task: forward_task.abort_handle() }),
    );
    tracing::info!(client_id = %client_id, user = %user.username, "client stream authenticated");

    let _ = tx.send(OutgoingFrame::Raw(json!({
        "type": "welcome",
        "status": "connected",
        "client_id": client_id,
        "protocol_version": "1.0",
        "message": "Client WebSocket connection established",
    })));

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                handle_client_frame(&state, &user, &connection_id, &client_id, &text, &tx).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.deregister(&connection_id, epoch);
    forward_task.abort();
    tracing::info!(client_id = %client_id, "client stream disconnected");
}

async fn handle_client_frame(
    state: &AppState,
    user: &relay_core::User,
    connection_id: &str,
    client_id: &str,
    text: &str,
    tx: &mpsc::UnboundedSender<OutgoingFrame>,
) {
    let packet = match parse_packet(text) {
        Ok(packet) => packet,
        Err(PacketError::InvalidJson) => {
            let _ = tx.send(OutgoingFrame::Raw(json!({"status": "error", "error": "INVALID_JSON"})));
            return;
        }
        Err(PacketError::MissingFields(fields)) => {
            let _ = tx.send(OutgoingFrame::Raw(json!({
                "status": "error",
                "error": "INVALID_PACKET",
                "message": format!("Missing: {fields:?}"),
            })));
            return;
        }
    };

    if packet.version != "1.0" {
        let _ = tx.send(OutgoingFrame::Raw(json!({"status": "error", "error": "UNSUPPORTED_VERSION"})));
        return;
    }

    let envelope = OuterEnvelope {
        device_id: packet.device_id.clone(),
        payload: packet.payload.clone(),
        signature: packet.signature.clone(),
        version: "1.0".to_string(),
        request_counter: None,
    };

    let pool = state.pool.clone();
    let user_for_lookup = user.clone();
    let envelope = match blocking(move || state_resolve_owned_device(pool, user_for_lookup, envelope)).await {
        Ok((_device, envelope)) => envelope,
        Err(_) => {
            let _ = tx.send(OutgoingFrame::Raw(json!({
                "status": "error",
                "error": "DEVICE_NOT_FOUND",
                "message": format!("Device {} not found or not owned by user", packet.device_id),
            })));
            return;
        }
    };

    let pool = state.pool.clone();
    let target_device_id = packet.device_id.clone();
    let _ = blocking(move || relay_core::store::touch_device_last_seen(&pool, &target_device_id)).await;

    let delivered = state
        .engine
        .deliver(&packet.device_id, envelope, Some(connection_id))
        .map(|outcome| outcome.delivered())
        .unwrap_or(false);

    if !delivered {
        let pool = state.pool.clone();
        let device_id = packet.device_id.clone();
        let payload = packet.payload.clone();
        let signature = packet.signature.clone();
        let _ = blocking(move || {
            relay_core::store::insert_envelope(&pool, &device_id, None, &payload, Some(&signature), Direction::ToDevice)
        })
        .await;
    }

    let _ = tx.send(OutgoingFrame::Raw(json!({
        "status": "success",
        "device_id": packet.device_id,
        "delivered": delivered,
        "queued": !delivered,
        "message": if delivered { "Delivered to device" } else { "Device offline, queued" },
    })));

    tracing::debug!(client_id = %client_id, device_id = %packet.device_id, delivered, "client command routed");
}

fn state_resolve_owned_device(
    pool: relay_core::DbPool,
    user: relay_core::User,
    envelope: OuterEnvelope,
) -> Result<(relay_core::Device, OuterEnvelope), relay_core::AuthError> {
    let device = AuthResolver::resolve_owned_device(&pool, &user, &envelope.device_id)?;
    Ok((device, envelope))
}
