//! WebSocket server implementation
//!
//! One socket per terminal client. Frames are JSON text:
//! inbound `{"event", "payload"}`, outbound
//! `{"type": "event", "event", "payload", "seq"}`.
//!
//! A connection starts unauthenticated; `authenticate` creates its
//! [`ConnectedSession`](registry::ConnectedSession). Events from one
//! connection are handled one at a time, so replies keep submission order.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::commands::builtin::builtin_registry;
use crate::commands::{CommandProcessor, OutputKind, OutputSink, SessionDirectory, SessionSummary};
use crate::config::{GatewayConfig, WsConfig};
use crate::logging::audit::{AuditEvent, AuditSink};
use crate::services::{DataEvent, Services};

mod handlers;
pub mod limits;
pub mod registry;
pub mod topics;

use registry::{ConnectionRegistry, ModeSnapshot};
pub use topics::{TopicPolicy, WsConfigError};

/// Close code for protocol/policy violations.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_NORMAL: u16 = 1000;

pub struct WsServerState {
    config: WsConfig,
    start_time: Instant,
    processor: CommandProcessor,
    services: Services,
    topic_policy: TopicPolicy,
    registry: Mutex<ConnectionRegistry>,
    audit: Arc<dyn AuditSink>,
    event_seq: AtomicU64,
    pub(crate) connection_tracker: limits::ConnectionTracker,
}

impl std::fmt::Debug for WsServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServerState")
            .field("config", &self.config)
            .field("start_time", &self.start_time)
            .field("processor", &self.processor)
            .field("topic_policy", &self.topic_policy)
            .field("sessions", &self.registry.lock().len())
            .finish_non_exhaustive()
    }
}

impl WsServerState {
    /// Build the state with the built-in command set.
    pub fn new(
        config: &GatewayConfig,
        services: Services,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, WsConfigError> {
        let registry = Arc::new(builtin_registry(&services));
        let processor = CommandProcessor::new(registry, audit.clone());
        Self::with_processor(config, services, processor, audit)
    }

    pub fn with_processor(
        config: &GatewayConfig,
        services: Services,
        processor: CommandProcessor,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, WsConfigError> {
        config.validate()?;
        let topic_policy = TopicPolicy::from_rules(&config.topics.rules)?;
        Ok(Self {
            connection_tracker: limits::ConnectionTracker::new(
                config.ws.max_connections,
                config.ws.max_per_ip,
            ),
            config: config.ws.clone(),
            start_time: Instant::now(),
            processor,
            services,
            topic_policy,
            registry: Mutex::new(ConnectionRegistry::new()),
            audit,
            event_seq: AtomicU64::new(0),
        })
    }

    pub fn processor(&self) -> &CommandProcessor {
        &self.processor
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Short synchronous access to the session maps. Never hold across an
    /// `.await`.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut ConnectionRegistry) -> R) -> R {
        f(&mut self.registry.lock())
    }

    fn next_event_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event) {
            tracing::warn!(target: "ws", error = %e, "failed to record audit entry");
        }
    }

    /// Remove a session and its index entries. Returns `false` when the
    /// connection had no session (never authenticated, or already closed).
    fn close_session(&self, conn_id: &str, reason: &str) -> bool {
        let removed = self.registry.lock().remove(conn_id);
        let Some(session) = removed else {
            return false;
        };
        session.cancel.cancel();
        tracing::info!(
            target: "ws",
            conn_id = %conn_id,
            user_id = %session.user_id,
            reason,
            "session closed"
        );
        self.audit(AuditEvent::SessionClosed {
            conn_id: conn_id.to_string(),
            user_id: session.user_id,
            reason: reason.to_string(),
        });
        true
    }

    /// Close every session idle for longer than `idle_timeout`.
    pub fn sweep_idle(&self, idle_timeout: Duration, now: Instant) -> Vec<String> {
        let expired = self.registry.lock().expired(idle_timeout, now);
        for conn_id in &expired {
            let tx = self.registry.lock().get(conn_id).map(|s| s.tx.clone());
            if let Some(tx) = tx {
                let _ = send_close(&tx, CLOSE_NORMAL, "idle timeout");
            }
            self.close_session(conn_id, "idle_timeout");
        }
        expired
    }

    /// Deliver `event` to every subscriber of its exact topic. Returns the
    /// number of connections it was handed to. No subscribers is not an error.
    pub fn publish(&self, event: &DataEvent) -> usize {
        let senders = self.registry.lock().subscriber_senders(&event.topic);
        if senders.is_empty() {
            tracing::trace!(target: "ws", topic = %event.topic, "no subscribers, dropping event");
            return 0;
        }
        let frame = EventFrame {
            frame_type: "event",
            event: event.kind.event_name(),
            payload: json!({
                "topic": event.topic,
                "data": event.data,
                "timestamp": now_ms(),
            }),
            seq: self.next_event_seq(),
        };
        let Ok(serialized) = serde_json::to_string(&frame) else {
            return 0;
        };
        senders
            .iter()
            .filter(|tx| send_text(tx, serialized.clone()).is_ok())
            .count()
    }
}

impl SessionDirectory for WsServerState {
    fn live_sessions(&self) -> Vec<SessionSummary> {
        self.registry.lock().summaries(Instant::now())
    }

    fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[derive(Debug, Serialize)]
struct EventFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'a str,
    event: &'a str,
    payload: Value,
    seq: u64,
}

/// Per-socket state the message loop threads through the event handlers.
struct ConnectionContext {
    conn_id: String,
    remote_ip: String,
    authenticated: bool,
    cancel: CancellationToken,
}

/// Pushes `terminal:output` lines straight to one socket.
struct ConnectionOutput<'a> {
    state: &'a WsServerState,
    tx: &'a mpsc::UnboundedSender<Message>,
}

impl OutputSink for ConnectionOutput<'_> {
    fn push(&self, kind: OutputKind, content: &str) {
        send_terminal_output(self.state, self.tx, kind, content, None);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let guard = match state.connection_tracker.try_acquire(addr.ip()) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::warn!(target: "ws", remote = %addr, "rejecting connection: {e}");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({ "error": "connection limit reached" })),
            )
                .into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket_with_guard(socket, state, addr, guard))
}

async fn handle_socket_with_guard(
    socket: WebSocket,
    state: Arc<WsServerState>,
    remote_addr: SocketAddr,
    _guard: limits::ConnectionGuard,
) {
    handle_socket(socket, state, remote_addr).await;
}

async fn handle_socket(socket: WebSocket, state: Arc<WsServerState>, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut conn = ConnectionContext {
        conn_id: Uuid::new_v4().to_string(),
        remote_ip: remote_addr.ip().to_string(),
        authenticated: false,
        cancel: CancellationToken::new(),
    };
    tracing::debug!(
        target: "ws",
        conn_id = %conn.conn_id,
        remote = %remote_addr,
        "connection opened"
    );

    run_message_loop(&mut receiver, &tx, &state, &mut conn).await;

    state.close_session(&conn.conn_id, "disconnect");
    drop(tx);
    let _ = send_task.await;
    tracing::debug!(target: "ws", conn_id = %conn.conn_id, "connection ended");
}

/// Signal used to communicate loop control flow from helper functions.
enum LoopSignal {
    Continue,
    Break,
}

async fn run_message_loop(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<WsServerState>,
    conn: &mut ConnectionContext,
) {
    loop {
        let next = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            next = receiver.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(_)) | None => break,
        };
        let frame = match decode_inbound_message(msg, tx, state.config.max_payload_bytes) {
            Ok(frame) => frame,
            Err(LoopSignal::Continue) => continue,
            Err(LoopSignal::Break) => break,
        };
        match handlers::dispatch_event(state, conn, tx, frame).await {
            LoopSignal::Continue => {}
            LoopSignal::Break => break,
        }
    }
}

/// Parsed inbound frame.
#[derive(Debug)]
struct InboundFrame {
    event: String,
    payload: Value,
}

/// Decode a raw WebSocket message. `Err(Continue)` skips control frames,
/// `Err(Break)` ends the connection (after queueing a close frame where the
/// client broke protocol).
fn decode_inbound_message(
    msg: Message,
    tx: &mpsc::UnboundedSender<Message>,
    max_payload_bytes: usize,
) -> Result<InboundFrame, LoopSignal> {
    let text = match msg {
        Message::Text(text) => text,
        Message::Binary(_) => {
            let _ = send_close(tx, CLOSE_POLICY_VIOLATION, "binary messages not supported");
            return Err(LoopSignal::Break);
        }
        Message::Close(_) => return Err(LoopSignal::Break),
        Message::Ping(_) | Message::Pong(_) => return Err(LoopSignal::Continue),
    };
    if text.as_str().len() > max_payload_bytes {
        let _ = send_close(tx, CLOSE_POLICY_VIOLATION, "payload too large");
        return Err(LoopSignal::Break);
    }
    match parse_inbound_frame(text.as_str()) {
        Some(frame) => Ok(frame),
        None => {
            let _ = send_close(tx, CLOSE_POLICY_VIOLATION, "invalid frame");
            Err(LoopSignal::Break)
        }
    }
}

fn parse_inbound_frame(text: &str) -> Option<InboundFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    let event = obj.get("event")?.as_str()?.to_string();
    let payload = obj.get("payload").cloned().unwrap_or(Value::Null);
    Some(InboundFrame { event, payload })
}

/// Spawn the idle sweep. Runs until `shutdown` flips to `true`.
pub fn spawn_idle_sweep_task(
    state: Arc<WsServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(state.config.idle_sweep_interval_secs);
    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let closed = state.sweep_idle(idle_timeout, Instant::now());
                    if !closed.is_empty() {
                        tracing::info!(
                            target: "gateway",
                            count = closed.len(),
                            "closed idle sessions"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Forward externally produced data events to the subscription bus.
pub fn spawn_data_feed_task(
    state: Arc<WsServerState>,
    mut events: mpsc::Receiver<DataEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let delivered = state.publish(&event);
                    tracing::trace!(
                        target: "ws",
                        topic = %event.topic,
                        delivered,
                        "data event published"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<Message>, payload: &T) -> Result<(), ()> {
    let text = serde_json::to_string(payload).map_err(|_| ())?;
    tx.send(Message::Text(text.into())).map_err(|_| ())
}

/// Send a pre-serialized frame; used by fan-out to serialize once.
fn send_text(tx: &mpsc::UnboundedSender<Message>, text: String) -> Result<(), ()> {
    tx.send(Message::Text(text.into())).map_err(|_| ())
}

fn send_event(
    state: &WsServerState,
    tx: &mpsc::UnboundedSender<Message>,
    event: &str,
    payload: Value,
) {
    let frame = EventFrame {
        frame_type: "event",
        event,
        payload,
        seq: state.next_event_seq(),
    };
    let _ = send_json(tx, &frame);
}

fn send_terminal_output(
    state: &WsServerState,
    tx: &mpsc::UnboundedSender<Message>,
    kind: OutputKind,
    content: &str,
    result: Option<Value>,
) {
    let mut payload = json!({
        "type": kind,
        "content": content,
        "timestamp": now_ms(),
    });
    if let (Some(result), Some(obj)) = (result, payload.as_object_mut()) {
        obj.insert("result".to_string(), result);
    }
    send_event(state, tx, "terminal:output", payload);
}

fn send_state_update(
    state: &WsServerState,
    tx: &mpsc::UnboundedSender<Message>,
    modes: ModeSnapshot,
) {
    send_event(
        state,
        tx,
        "state:update",
        json!({
            "dangerousMode": modes.dangerous_mode,
            "aiMode": modes.ai_mode,
            "permissionLevel": modes.permission_level,
        }),
    );
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) -> Result<(), ()> {
    // Close reasons are capped at 123 bytes by the protocol
    let truncated_reason: String = reason.chars().take(123).collect();
    let frame = CloseFrame {
        code,
        reason: truncated_reason.into(),
    };
    tx.send(Message::Close(Some(frame))).map_err(|_| ())
}
