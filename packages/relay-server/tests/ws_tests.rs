//! Push-stream integration tests: a real in-process axum server plus
//! `tokio-tungstenite` clients, mirroring the pack's own
//! `receiver::tests::ws_connect_auth` style of spinning up a bound
//! `TcpListener` and connecting with a real WebSocket client.

use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use relay_core::store;
use relay_server::config::Config;
use relay_server::state::AppState;
use relay_server::app;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;
use http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

fn test_config() -> Config {
    Config {
        cloud_port: 9009,
        database_file: ":memory:".to_string(),
        message_retention_minutes: 5,
        default_devices_limit: 5,
        debug: false,
    }
}

async fn spawn_server(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.expect("serve");
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn connect_device(addr: &str, device_id: &str, token: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}/ws/{device_id}");
    let mut request = url.into_client_request().expect("client request");
    request
        .headers_mut()
        .insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
    let (socket, _) = tokio_tungstenite::connect_async(request).await.expect("connect");
    socket
}

async fn connect_client(addr: &str, client_id: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}/ws/client/{client_id}");
    let (socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    socket
}

async fn recv_json(
    socket: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("ws error");
    match message {
        Message::Text(text) => serde_json::from_str(&text).expect("invalid json frame"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Scenario 1: client and device both online. The client's command reaches
/// the device verbatim and is ACKed; the device's reply reaches the client
/// verbatim; no durable row is left behind.
#[tokio::test]
async fn hot_path_both_online_round_trips_command_and_response() {
    let pool = store::open_memory_pool().unwrap();
    let user = store::create_user(&pool, "alice", 5).unwrap();
    store::upsert_device(&pool, &user, "D1", None).unwrap();
    let pool_for_assertions = pool.clone();
    let state = AppState::new(pool, test_config());
    let addr = spawn_server(state).await;

    let mut device = connect_device(&addr, "D1", &user.api_token).await;
    let welcome = recv_json(&mut device).await;
    assert_eq!(welcome["type"], "welcome");

    let mut client = connect_client(&addr, "c1").await;
    client
        .send(Message::Text(json!({"type": "auth", "token": user.api_token}).to_string()))
        .await
        .unwrap();
    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome["type"], "welcome");

    client
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "p1", "signature": "s1", "version": "1.0"}).to_string(),
        ))
        .await
        .unwrap();

    let ack = recv_json(&mut client).await;
    assert_eq!(ack["status"], "success");
    assert_eq!(ack["delivered"], true);
    assert_eq!(ack["queued"], false);

    let command = recv_json(&mut device).await;
    assert_eq!(command["device_id"], "D1");
    assert_eq!(command["payload"], "p1");
    assert_eq!(command["signature"], "s1");

    device
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "r1", "signature": "s2", "version": "1.0"}).to_string(),
        ))
        .await
        .unwrap();

    let response = recv_json(&mut client).await;
    assert_eq!(response["payload"], "r1");
    assert_eq!(response["signature"], "s2");

    assert_eq!(
        store::list_envelopes(&pool_for_assertions, "D1", relay_core::Direction::ToClient)
            .unwrap()
            .len(),
        0
    );
}

/// Scenario 6: a stream frame with an unsupported version elicits a
/// structured error and leaves the connection ACTIVE with no queue mutation.
#[tokio::test]
async fn unsupported_version_on_device_stream_is_rejected_in_band() {
    let pool = store::open_memory_pool().unwrap();
    let user = store::create_user(&pool, "alice", 5).unwrap();
    store::upsert_device(&pool, &user, "D1", None).unwrap();
    let state = AppState::new(pool, test_config());
    let addr = spawn_server(state).await;

    let mut device = connect_device(&addr, "D1", &user.api_token).await;
    let _welcome = recv_json(&mut device).await;

    device
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "p", "signature": "s", "version": "0.9"}).to_string(),
        ))
        .await
        .unwrap();

    let error = recv_json(&mut device).await;
    assert_eq!(error["status"], "error");
    assert_eq!(error["error"], "UNSUPPORTED_VERSION");
}

/// A device stream with no Authorization header is rejected before it can do
/// anything else.
#[tokio::test]
async fn device_stream_without_token_is_rejected() {
    let pool = store::open_memory_pool().unwrap();
    let state = AppState::new(pool, test_config());
    let addr = spawn_server(state).await;

    let url = format!("ws://{addr}/ws/D1");
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");

    let error = recv_json(&mut socket).await;
    assert_eq!(error["error"], "AUTH_REQUIRED");
}

/// Client stream auth must arrive within the deadline as an explicit
/// `{type:"auth"}` message — sending a command first is rejected, not
/// silently replayed (the legacy header-auth fallback is removed).
#[tokio::test]
async fn client_stream_rejects_command_sent_before_auth() {
    let pool = store::open_memory_pool().unwrap();
    let user = store::create_user(&pool, "alice", 5).unwrap();
    store::upsert_device(&pool, &user, "D1", None).unwrap();
    let state = AppState::new(pool, test_config());
    let addr = spawn_server(state).await;

    let mut client = connect_client(&addr, "c1").await;
    client
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "p", "signature": "s", "version": "1.0"}).to_string(),
        ))
        .await
        .unwrap();

    let error = recv_json(&mut client).await;
    assert_eq!(error["error"], "AUTH_REQUIRED");
}

/// Scenario 5 over the stream transport: a client authenticated as one user
/// cannot command a device owned by another.
#[tokio::test]
async fn client_cannot_command_a_device_it_does_not_own() {
    let pool = store::open_memory_pool().unwrap();
    let owner = store::create_user(&pool, "alice", 5).unwrap();
    store::upsert_device(&pool, &owner, "D1", None).unwrap();
    let mallory = store::create_user(&pool, "mallory", 5).unwrap();
    let state = AppState::new(pool, test_config());
    let addr = spawn_server(state).await;

    let mut client = connect_client(&addr, "c1").await;
    client
        .send(Message::Text(json!({"type": "auth", "token": mallory.api_token}).to_string()))
        .await
        .unwrap();
    let _welcome = recv_json(&mut client).await;

    client
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "p", "signature": "s", "version": "1.0"}).to_string(),
        ))
        .await
        .unwrap();

    let error = recv_json(&mut client).await;
    assert_eq!(error["error"], "DEVICE_NOT_FOUND");
}

/// A device that reconnects displaces its own stale stream. The stale
/// connection's belated cleanup (triggered by the client-side close below)
/// must not evict the newer registration — the device must stay reachable.
#[tokio::test]
async fn reconnecting_device_does_not_go_dark_when_its_stale_connection_closes() {
    let pool = store::open_memory_pool().unwrap();
    let user = store::create_user(&pool, "alice", 5).unwrap();
    store::upsert_device(&pool, &user, "D1", None).unwrap();
    let state = AppState::new(pool, test_config());
    let addr = spawn_server(state).await;

    let mut first = connect_device(&addr, "D1", &user.api_token).await;
    let _welcome = recv_json(&mut first).await;

    let mut second = connect_device(&addr, "D1", &user.api_token).await;
    let _welcome = recv_json(&mut second).await;

    // Close the displaced connection from the client side so its read loop
    // runs its own end-of-life deregister.
    let _ = first.close().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = connect_client(&addr, "c1").await;
    client
        .send(Message::Text(json!({"type": "auth", "token": user.api_token}).to_string()))
        .await
        .unwrap();
    let _welcome = recv_json(&mut client).await;

    client
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "p1", "signature": "s1", "version": "1.0"}).to_string(),
        ))
        .await
        .unwrap();

    let ack = recv_json(&mut client).await;
    assert_eq!(ack["delivered"], true, "the surviving connection must still be live");

    let command = recv_json(&mut second).await;
    assert_eq!(command["payload"], "p1");
}

/// An HTTP push for an unrelated `to_client` payload must not consume a
/// device's pending-response slot — that slot is reserved for the device's
/// own in-band reply to a client command, not a side-channel HTTP push.
#[tokio::test]
async fn http_push_does_not_hijack_a_pending_response_slot() {
    let pool = store::open_memory_pool().unwrap();
    let user = store::create_user(&pool, "alice", 5).unwrap();
    store::upsert_device(&pool, &user, "D1", None).unwrap();
    let state = AppState::new(pool, test_config());
    let assertions_state = state.clone();
    let http_state = state.clone();
    let addr = spawn_server(state).await;

    let mut client = connect_client(&addr, "c1").await;
    client
        .send(Message::Text(json!({"type": "auth", "token": user.api_token}).to_string()))
        .await
        .unwrap();
    let _welcome = recv_json(&mut client).await;

    // D1 is offline: this command is queued, but it still registers c1 as
    // the device's waiting client for its next reply.
    client
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "cmd", "signature": "s", "version": "1.0"}).to_string(),
        ))
        .await
        .unwrap();
    let ack = recv_json(&mut client).await;
    assert_eq!(ack["delivered"], false);
    assert_eq!(assertions_state.registry.waiting_client("D1"), Some("client_c1".to_string()));

    let response = app(http_state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/push")
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", user.api_token))
                .body(Body::from(
                    json!({
                        "device_id": "D1",
                        "payload": "unrelated",
                        "signature": "s2",
                        "version": "1.0",
                        "direction": "to_client",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let _ = response.into_body().collect().await.unwrap().to_bytes();

    assert_eq!(
        assertions_state.registry.waiting_client("D1"),
        Some("client_c1".to_string()),
        "the HTTP push must not have consumed c1's pending-response slot"
    );

    // D1 now comes online and sends its real reply — it must still reach c1.
    let mut device = connect_device(&addr, "D1", &user.api_token).await;
    let _welcome = recv_json(&mut device).await;
    device
        .send(Message::Text(
            json!({"device_id": "D1", "payload": "reply", "signature": "s3", "version": "1.0"}).to_string(),
        ))
        .await
        .unwrap();

    let response = recv_json(&mut client).await;
    assert_eq!(response["payload"], "reply");
}
