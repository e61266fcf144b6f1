//! Integration tests for the gateway WebSocket lifecycle.
//!
//! Each test spins up a real gateway on an ephemeral port via
//! [`run_server_with_config`], drives it with a tokio-tungstenite client, and
//! shuts it down cleanly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chatcell::config::GatewayConfig;
use chatcell::history::MemoryHistory;
use chatcell::isolation::{InProcessIsolation, IsolationManager};
use chatcell::server::{run_server_with_config, GatewayState, ServerConfig, ServerHandle};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestGateway {
    handle: ServerHandle,
    history: Arc<MemoryHistory>,
}

/// Each test passes its own worker port base so the per-device servers the
/// gateways stand up never collide across parallel tests.
async fn start_test_gateway(worker_port_base: u16) -> TestGateway {
    let history = Arc::new(MemoryHistory::new());
    let isolation = IsolationManager::new(Box::new(InProcessIsolation::new()), worker_port_base);
    let state = Arc::new(GatewayState::new(
        &GatewayConfig::default(),
        history.clone(),
        isolation,
    ));
    let handle = run_server_with_config(ServerConfig::for_testing(state))
        .await
        .unwrap();
    TestGateway { handle, history }
}

async fn connect(gateway: &TestGateway) -> WsClient {
    let (client, _) = connect_async(gateway.handle.ws_url()).await.unwrap();
    client
}

/// Next JSON text frame from the client, with a timeout.
async fn next_json(client: &mut WsClient) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended unexpectedly")
        .expect("websocket error");
    serde_json::from_str(msg.to_text().expect("expected text frame")).unwrap()
}

async fn send_json(client: &mut WsClient, value: Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

// ---------------------------------------------------------------------------
// Initialization frames arrive exactly once each, in order
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_sends_init_frames_in_order() {
    let gateway = start_test_gateway(43500).await;
    let mut client = connect(&gateway).await;

    let init = next_json(&mut client).await;
    assert_eq!(init["type"], "session_init");
    let session_id = init["sessionId"].as_str().unwrap().to_string();
    let device_id = init["deviceId"].as_str().unwrap().to_string();
    assert!(session_id.starts_with(&device_id));
    assert_eq!(init["ipAddress"], "127.0.0.1");

    let welcome = next_json(&mut client).await;
    assert_eq!(welcome["type"], "connection");
    assert_eq!(welcome["deviceId"], device_id);
    assert!(!welcome["message"].as_str().unwrap().is_empty());

    let history = next_json(&mut client).await;
    assert_eq!(history["type"], "history");
    assert!(history["messages"].as_array().unwrap().is_empty());

    // exactly one session registered for this connection
    assert_eq!(gateway.handle.state().sessions.len(), 1);
    assert!(gateway.handle.state().sessions.contains(&session_id));

    drop(client);
    gateway.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario: subscribe to "alerts" yields exactly one ack
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_scenario() {
    let gateway = start_test_gateway(43510).await;
    let mut client = connect(&gateway).await;

    let init = next_json(&mut client).await;
    let session_id = init["sessionId"].as_str().unwrap().to_string();
    let _welcome = next_json(&mut client).await;
    let _history = next_json(&mut client).await;

    send_json(
        &mut client,
        serde_json::json!({ "type": "subscribe", "sessionId": session_id, "channel": "alerts" }),
    )
    .await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["channel"], "alerts");

    // nothing else shows up
    let extra = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(extra.is_err(), "expected exactly one subscribed frame");

    drop(client);
    gateway.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario: chat echo plus persisted history
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_echo_and_persistence() {
    let gateway = start_test_gateway(43520).await;
    let mut client = connect(&gateway).await;

    let init = next_json(&mut client).await;
    let session_id = init["sessionId"].as_str().unwrap().to_string();
    let device_id = init["deviceId"].as_str().unwrap().to_string();
    let _welcome = next_json(&mut client).await;
    let _history = next_json(&mut client).await;

    send_json(
        &mut client,
        serde_json::json!({ "type": "chat", "sessionId": session_id, "content": "hello" }),
    )
    .await;

    let echo = next_json(&mut client).await;
    assert_eq!(echo["type"], "chat");
    assert_eq!(echo["sessionId"], session_id.as_str());
    assert_eq!(echo["content"], "hello");
    assert!(!echo["timestamp"].as_str().unwrap().is_empty());

    // persistence is fire-and-forget; poll briefly
    for _ in 0..20 {
        if gateway.history.entry_count(&device_id) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(gateway.history.entry_count(&device_id), 1);

    drop(client);
    gateway.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Unknown session reference closes the socket with the policy code
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_session_closes_with_1008() {
    let gateway = start_test_gateway(43530).await;
    let mut client = connect(&gateway).await;

    let _init = next_json(&mut client).await;
    let _welcome = next_json(&mut client).await;
    let _history = next_json(&mut client).await;

    send_json(
        &mut client,
        serde_json::json!({ "type": "chat", "sessionId": "forged-session", "content": "hi" }),
    )
    .await;

    let mut saw_policy_close = false;
    while let Ok(Some(Ok(msg))) =
        tokio::time::timeout(Duration::from_secs(5), client.next()).await
    {
        if let Message::Close(Some(frame)) = msg {
            assert_eq!(frame.code, CloseCode::Policy);
            saw_policy_close = true;
            break;
        }
    }
    assert!(saw_policy_close, "expected a 1008 close frame");

    // the session is gone from the registry
    for _ in 0..20 {
        if gateway.handle.state().sessions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(gateway.handle.state().sessions.is_empty());

    gateway.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Malformed, binary, and oversized input is not fatal to the session
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frame_keeps_connection_open() {
    let gateway = start_test_gateway(43540).await;
    let mut client = connect(&gateway).await;

    let init = next_json(&mut client).await;
    let session_id = init["sessionId"].as_str().unwrap().to_string();
    let _welcome = next_json(&mut client).await;
    let _history = next_json(&mut client).await;

    client.send(Message::text("{{ not json")).await.unwrap();
    client
        .send(Message::binary(vec![0x00, 0x01, 0x02]))
        .await
        .unwrap();
    client.send(Message::text("x".repeat(70_000))).await.unwrap();

    // the connection survives and keeps working
    send_json(
        &mut client,
        serde_json::json!({ "type": "chat", "sessionId": session_id, "content": "still here" }),
    )
    .await;
    let echo = next_json(&mut client).await;
    assert_eq!(echo["content"], "still here");

    drop(client);
    gateway.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// No cross-device leakage with concurrent clients
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chat_never_leaks_across_devices() {
    let gateway = start_test_gateway(43550).await;
    let mut alice = connect(&gateway).await;
    let mut bob = connect(&gateway).await;

    let alice_init = next_json(&mut alice).await;
    let alice_session = alice_init["sessionId"].as_str().unwrap().to_string();
    let _ = next_json(&mut alice).await;
    let _ = next_json(&mut alice).await;

    let bob_init = next_json(&mut bob).await;
    assert_ne!(alice_init["deviceId"], bob_init["deviceId"]);
    let _ = next_json(&mut bob).await;
    let _ = next_json(&mut bob).await;

    send_json(
        &mut alice,
        serde_json::json!({ "type": "chat", "sessionId": alice_session, "content": "secret" }),
    )
    .await;

    let echo = next_json(&mut alice).await;
    assert_eq!(echo["content"], "secret");
    assert_eq!(echo["sessionId"], alice_session.as_str());

    // bob sees nothing
    let leaked = tokio::time::timeout(Duration::from_millis(300), bob.next()).await;
    assert!(leaked.is_err(), "chat frame leaked to another device");

    drop(alice);
    drop(bob);
    gateway.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// A connecting device gets a live isolated server
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_stands_up_isolated_server() {
    let gateway = start_test_gateway(43570).await;
    let mut client = connect(&gateway).await;

    let init = next_json(&mut client).await;
    let device_id = init["deviceId"].as_str().unwrap().to_string();
    let _welcome = next_json(&mut client).await;
    let _history = next_json(&mut client).await;

    // the device is registered with the isolation manager by the time the
    // init frames arrive
    let isolation = &gateway.handle.state().isolation;
    assert_eq!(isolation.active(), 1);
    let tracked = isolation
        .tracker()
        .get(&device_id)
        .expect("device missing from tracker");
    assert!(tracked.port >= 43570);

    // and its dedicated echo server is actually reachable on that port
    let (mut echo, _) = connect_async(format!("ws://127.0.0.1:{}", tracked.port))
        .await
        .expect("isolated server not reachable");
    echo.send(Message::text("ping")).await.unwrap();
    let back = echo.next().await.unwrap().unwrap();
    assert_eq!(back.to_text().unwrap(), "ping");

    // chat traffic refreshes the device's activity clock
    let before = tracked.last_active_ms;
    tokio::time::sleep(Duration::from_millis(30)).await;
    send_json(
        &mut client,
        serde_json::json!({
            "type": "chat",
            "sessionId": init["sessionId"].as_str().unwrap(),
            "content": "keepalive"
        }),
    )
    .await;
    let _echo = next_json(&mut client).await;
    let after = isolation
        .tracker()
        .get(&device_id)
        .expect("device record lost")
        .last_active_ms;
    assert!(after > before, "chat traffic did not touch the device record");

    drop(client);
    drop(echo);
    gateway.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Health endpoint and clean shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint_and_shutdown() {
    let gateway = start_test_gateway(43560).await;

    let url = format!("{}/health", gateway.handle.base_url());
    let resp = reqwest::get(&url).await.expect("GET /health failed");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeSessions"], 0);

    tokio::time::timeout(Duration::from_secs(10), gateway.handle.shutdown())
        .await
        .expect("shutdown should complete promptly");
}
