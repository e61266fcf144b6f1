//! WebSocket gateway: connection upgrade broker and message router.
//!
//! Every upgrade gets a throwaway per-connection server context: its own
//! handler task, its own send task, and its own session registry entry. The
//! router validates each inbound frame's session reference and dispatches on
//! the declared type; an unknown session reference is the only error fatal to
//! a socket.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::history::{ChatEntry, HistoryStore};
use crate::identity;
use crate::isolation::IsolationManager;
use crate::registry::{Session, SessionRegistry};

/// WebSocket close code for protocol-policy violations.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

const WELCOME_MESSAGE: &str = "connected to chatcell";

/// Shared gateway state, passed by reference into each component at
/// construction. No ambient statics.
pub struct GatewayState {
    start_time: Instant,
    max_payload: usize,
    pub sessions: SessionRegistry,
    pub history: Arc<dyn HistoryStore>,
    pub isolation: Arc<IsolationManager>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("sessions", &self.sessions.len())
            .field("devices", &self.isolation.active())
            .finish()
    }
}

impl GatewayState {
    pub fn new(
        config: &GatewayConfig,
        history: Arc<dyn HistoryStore>,
        isolation: Arc<IsolationManager>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            max_payload: config.max_payload_bytes,
            sessions: SessionRegistry::new(),
            history,
            isolation,
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// Frames the gateway sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    SessionInit {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "ipAddress")]
        ip_address: String,
    },
    Connection {
        #[serde(rename = "deviceId")]
        device_id: String,
        message: String,
    },
    History {
        messages: Vec<ChatEntry>,
    },
    Chat {
        #[serde(rename = "sessionId")]
        session_id: String,
        content: String,
        timestamp: String,
    },
    Subscribed {
        channel: String,
    },
}

/// Frames clients send to the gateway. Closed set; anything else lands on
/// `Unknown` and is logged and ignored.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Chat { content: String },
    Subscribe { channel: String },
    #[serde(other)]
    Unknown,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // The Sec-WebSocket-Key is the per-handshake token the transport already
    // supplies; it is fresh on every connection.
    let handshake_token = headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, handshake_token))
}

/// Per-connection server context. Owns the socket for exactly one connection;
/// nothing here is shared with any other device's connection.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    remote_addr: SocketAddr,
    handshake_token: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let device_id = identity::connection_identity(&handshake_token, &remote_addr);
    // Device id plus connect time keeps the session id human-diagnosable.
    let session_id = format!("{}-{}", device_id, now_ms());

    let session = Session {
        session_id: session_id.clone(),
        device_id: device_id.clone(),
        remote_addr,
        sender: tx.clone(),
        connected_at_ms: now_ms(),
        subscriptions: HashSet::new(),
    };
    if let Err(err) = state.sessions.register(session) {
        error!(target: "ws", error = %err, "session registration failed");
        let _ = send_close(&tx, CLOSE_POLICY_VIOLATION, "session registration failed");
        drop(tx);
        let _ = send_task.await;
        return;
    }
    info!(
        target: "ws",
        session_id = %session_id,
        device_id = %device_id,
        remote = %remote_addr,
        "session established"
    );

    // First traffic for a device stands up its isolated server; from here on
    // `touch` and the idle reaper operate on a live tracker record.
    match state.isolation.connect(&device_id).await {
        Ok(port) => {
            debug!(target: "ws", device_id = %device_id, port, "isolated server ready");
        }
        Err(err) => {
            warn!(
                target: "ws",
                device_id = %device_id,
                error = %err,
                "isolated server unavailable, continuing without isolation"
            );
        }
    }

    let _ = send_json(
        &tx,
        &ServerFrame::SessionInit {
            session_id: session_id.clone(),
            device_id: device_id.clone(),
            ip_address: remote_addr.ip().to_string(),
        },
    );
    let _ = send_json(
        &tx,
        &ServerFrame::Connection {
            device_id: device_id.clone(),
            message: WELCOME_MESSAGE.to_string(),
        },
    );

    // History trails the first two frames: the fetch runs in its own task so
    // a slow store never blocks the handshake. On failure the frame is
    // omitted, not the connection.
    {
        let history = Arc::clone(&state.history);
        let history_tx = tx.clone();
        let history_device = device_id.clone();
        tokio::spawn(async move {
            match history.chat_history(&history_device).await {
                Ok(messages) => {
                    let _ = send_json(&history_tx, &ServerFrame::History { messages });
                }
                Err(err) => {
                    warn!(
                        target: "history",
                        device_id = %history_device,
                        error = %err,
                        "history fetch failed, frame omitted"
                    );
                }
            }
        });
    }

    while let Some(next) = receiver.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let text = match message_to_text(msg) {
            InboundText::Text(text) => text,
            InboundText::Binary => {
                debug!(target: "ws", session_id = %session_id, "binary frame dropped");
                continue;
            }
            InboundText::Control => continue,
            InboundText::Close => break,
        };
        if text.len() > state.max_payload {
            debug!(
                target: "ws",
                session_id = %session_id,
                len = text.len(),
                "oversized frame dropped"
            );
            continue;
        }
        match route_frame(&state, &tx, &text) {
            RouteOutcome::Continue => {}
            RouteOutcome::Close(reason) => {
                let _ = send_close(&tx, CLOSE_POLICY_VIOLATION, reason);
                break;
            }
        }
    }

    // Registry cleanup happens at socket close, before the send task drains.
    state.sessions.remove(&session_id);
    info!(target: "ws", session_id = %session_id, "session closed");
    drop(tx);
    let _ = send_task.await;
}

enum RouteOutcome {
    Continue,
    Close(&'static str),
}

/// Route one inbound frame.
///
/// Malformed input is dropped and the connection survives; a missing or
/// unknown session reference is the sole hard failure path.
fn route_frame(
    state: &Arc<GatewayState>,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) -> RouteOutcome {
    let value = match serde_json::from_str::<Value>(text) {
        Ok(val) => val,
        Err(err) => {
            debug!(target: "ws", error = %err, "malformed frame dropped");
            return RouteOutcome::Continue;
        }
    };

    let session = value
        .get("sessionId")
        .and_then(|v| v.as_str())
        .and_then(|id| state.sessions.lookup(id));
    let Some(session) = session else {
        return RouteOutcome::Close("unknown session");
    };
    state.isolation.touch(&session.device_id);

    let frame = match serde_json::from_value::<ClientFrame>(value) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(
                target: "ws",
                session_id = %session.session_id,
                error = %err,
                "malformed frame dropped"
            );
            return RouteOutcome::Continue;
        }
    };

    match frame {
        ClientFrame::Chat { content } => {
            // Echo to the originating socket only, stamped with the
            // canonical session id and a server timestamp.
            let _ = send_json(
                tx,
                &ServerFrame::Chat {
                    session_id: session.session_id.clone(),
                    content: content.clone(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                },
            );

            // Best-effort persist; the result is discarded after logging.
            let history = Arc::clone(&state.history);
            let device_id = session.device_id.clone();
            tokio::spawn(async move {
                if let Err(err) = history.save_message(&device_id, &content).await {
                    warn!(
                        target: "history",
                        device_id = %device_id,
                        error = %err,
                        "chat persist failed"
                    );
                }
            });
        }
        ClientFrame::Subscribe { channel } => {
            state.sessions.subscribe(&session.session_id, &channel);
            let _ = send_json(tx, &ServerFrame::Subscribed { channel });
        }
        ClientFrame::Unknown => {
            debug!(
                target: "ws",
                session_id = %session.session_id,
                "unhandled frame type ignored"
            );
        }
    }
    RouteOutcome::Continue
}

enum InboundText {
    Text(String),
    Binary,
    Control,
    Close,
}

fn message_to_text(msg: Message) -> InboundText {
    match msg {
        Message::Text(text) => InboundText::Text(text),
        Message::Binary(_) => InboundText::Binary,
        Message::Close(_) => InboundText::Close,
        Message::Ping(_) | Message::Pong(_) => InboundText::Control,
    }
}

fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<Message>, payload: &T) -> Result<(), ()> {
    let text = serde_json::to_string(payload).map_err(|_| ())?;
    tx.send(Message::Text(text)).map_err(|_| ())
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) -> Result<(), ()> {
    // Truncate close reason to fit the WebSocket 123-byte limit
    let truncated: String = reason.chars().take(123).collect();
    let frame = CloseFrame {
        code,
        reason: truncated.into(),
    };
    tx.send(Message::Close(Some(frame))).map_err(|_| ())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
