//! End-to-end WebSocket tests against a running gateway.
//!
//! Drives `/ws` with a tokio-tungstenite client: authentication, command
//! round trips, subscriptions and fan-out, and connection teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use termgate::commands::builtin::builtin_registry;
use termgate::commands::{
    CommandDescriptor, CommandError, CommandHandler, CommandOutput, CommandProcessor,
    CommandRegistry, ExecutionContext, ParsedCommand, PermissionLevel,
};
use termgate::config::{GatewayConfig, TokenConfig};
use termgate::logging::audit::{AuditEvent, MemoryAuditSink};
use termgate::server::startup::{run_server_with_config, ServerConfig, ServerHandle};
use termgate::server::ws::WsServerState;
use termgate::services::{DataEvent, DataEventKind, Services};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.tokens = vec![
        TokenConfig {
            token: "tok-alice".into(),
            user_id: "alice".into(),
            permission: PermissionLevel::Public,
            dangerous_mode: false,
            ai_mode: false,
        },
        TokenConfig {
            token: "tok-root".into(),
            user_id: "root".into(),
            permission: PermissionLevel::Admin,
            dangerous_mode: false,
            ai_mode: false,
        },
    ];
    config
}

async fn start_with(
    config: GatewayConfig,
    tweak: impl FnOnce(&mut ServerConfig),
) -> (ServerHandle, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let state = WsServerState::new(
        &config,
        Services::standalone(&config.auth.tokens),
        audit.clone(),
    )
    .unwrap();
    let mut server_config = ServerConfig::for_testing(Arc::new(state));
    tweak(&mut server_config);
    (run_server_with_config(server_config).await.unwrap(), audit)
}

async fn start() -> (ServerHandle, Arc<MemoryAuditSink>) {
    start_with(gateway_config(), |_| {}).await
}

struct Client {
    ws: Ws,
}

impl Client {
    async fn connect(handle: &ServerHandle) -> Self {
        let (ws, _resp) = connect_async(handle.ws_url()).await.expect("ws connect failed");
        Client { ws }
    }

    async fn send(&mut self, event: &str, payload: Value) {
        let frame = json!({ "event": event, "payload": payload }).to_string();
        self.ws.send(Message::text(frame)).await.unwrap();
    }

    /// Next text frame as JSON; a close frame becomes `{"close": code, "reason": ..}`.
    async fn recv(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("ws error");
            match msg {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Close(Some(frame)) => {
                    return json!({
                        "close": u16::from(frame.code),
                        "reason": frame.reason.as_str(),
                    })
                }
                Message::Close(None) => return json!({ "close": null }),
                _ => continue,
            }
        }
    }

    async fn command(&mut self, line: &str) -> (Value, Value) {
        self.send("terminal:command", json!({ "command": line })).await;
        let echo = self.recv().await;
        let mut result = self.recv().await;
        while result["event"] == "state:update" || result["payload"]["type"] == "system" {
            result = self.recv().await;
        }
        (echo, result)
    }

    async fn authenticate(&mut self, token: &str) -> Value {
        self.send("authenticate", json!({ "token": token })).await;
        let success = self.recv().await;
        assert_eq!(success["event"], "auth:success", "{success}");
        let state = self.recv().await;
        assert_eq!(state["event"], "state:update");
        success["payload"].clone()
    }
}

async fn wait_for_sessions(handle: &ServerHandle, expected: usize) {
    for _ in 0..100 {
        if handle.ws_state().with_registry(|r| r.len()) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session count never reached {expected}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unauthenticated_command_gets_error() {
    let (handle, _audit) = start().await;
    let mut client = Client::connect(&handle).await;

    client.send("terminal:command", json!({ "command": "help" })).await;
    let reply = client.recv().await;
    assert_eq!(reply["event"], "terminal:output");
    assert_eq!(reply["payload"]["type"], "error");
    assert_eq!(reply["payload"]["content"], "Not authenticated");
    assert!(handle.ws_state().with_registry(|r| r.is_empty()));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_authenticated_commands_in_order() {
    let (handle, audit) = start().await;
    let mut client = Client::connect(&handle).await;

    let auth = client.authenticate("tok-alice").await;
    assert_eq!(auth["userId"], "alice");
    assert_eq!(auth["permissionLevel"], "PUBLIC");

    for word in ["first", "second", "third"] {
        client
            .send("terminal:command", json!({ "command": format!("echo {word}") }))
            .await;
    }
    let mut outputs = Vec::new();
    let mut last_seq = 0;
    for _ in 0..6 {
        let frame = client.recv().await;
        let seq = frame["seq"].as_u64().unwrap();
        assert!(seq > last_seq);
        last_seq = seq;
        outputs.push((
            frame["payload"]["type"].as_str().unwrap().to_string(),
            frame["payload"]["content"].as_str().unwrap().to_string(),
        ));
    }
    assert_eq!(
        outputs,
        vec![
            ("command".to_string(), "echo first".to_string()),
            ("success".to_string(), "first".to_string()),
            ("command".to_string(), "echo second".to_string()),
            ("success".to_string(), "second".to_string()),
            ("command".to_string(), "echo third".to_string()),
            ("success".to_string(), "third".to_string()),
        ]
    );

    let executed = audit
        .events()
        .iter()
        .filter(|e| matches!(e, AuditEvent::CommandExecuted { .. }))
        .count();
    assert_eq!(executed, 3);

    handle.shutdown().await;
}

/// Replies with its own name after a fixed delay.
struct Delayed {
    name: &'static str,
    delay: Duration,
}

#[async_trait]
impl CommandHandler for Delayed {
    async fn execute(
        &self,
        _parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        tokio::time::sleep(self.delay).await;
        Ok(CommandOutput::text(self.name))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_command_reply_precedes_fast_one() {
    let config = gateway_config();
    let services = Services::standalone(&config.auth.tokens);
    let mut registry = builtin_registry(&services);
    for (name, delay) in [("slow", Duration::from_millis(300)), ("fast", Duration::ZERO)] {
        registry.register(CommandDescriptor::new(name, Arc::new(Delayed { name, delay })));
    }
    let audit = Arc::new(MemoryAuditSink::new());
    let processor = CommandProcessor::new(Arc::new(registry), audit.clone());
    let state = WsServerState::with_processor(&config, services, processor, audit).unwrap();
    let handle = run_server_with_config(ServerConfig::for_testing(Arc::new(state)))
        .await
        .unwrap();

    let mut client = Client::connect(&handle).await;
    client.authenticate("tok-alice").await;

    // Both frames are on the wire before the slow one finishes.
    client.send("terminal:command", json!({ "command": "slow" })).await;
    client.send("terminal:command", json!({ "command": "fast" })).await;

    let mut successes = Vec::new();
    while successes.len() < 2 {
        let frame = client.recv().await;
        if frame["payload"]["type"] == "success" {
            successes.push(frame["payload"]["content"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(successes, vec!["slow", "fast"]);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_token_closes_with_policy_violation() {
    let (handle, _audit) = start().await;
    let mut client = Client::connect(&handle).await;

    client.send("authenticate", json!({ "token": "stolen" })).await;
    let error = client.recv().await;
    assert_eq!(error["event"], "auth:error");
    assert_eq!(error["payload"]["message"], "invalid session token");
    let close = client.recv().await;
    assert_eq!(close["close"], 1008);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dangerous_mode_reports_permission_error() {
    let (handle, _audit) = start().await;
    let mut client = Client::connect(&handle).await;
    client.authenticate("tok-alice").await;

    let (_echo, result) = client.command("dangerous-mode on").await;
    assert_eq!(result["payload"]["type"], "error");
    assert_eq!(
        result["payload"]["content"],
        "Insufficient permissions: 'dangerous-mode' requires ADVANCED, you have PUBLIC"
    );

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_toggle_pushes_state_update() {
    let (handle, _audit) = start().await;
    let mut client = Client::connect(&handle).await;
    client.authenticate("tok-root").await;

    client
        .send("terminal:command", json!({ "command": "dangerous-mode on" }))
        .await;
    assert_eq!(client.recv().await["payload"]["type"], "command");
    let update = client.recv().await;
    assert_eq!(update["event"], "state:update");
    assert_eq!(update["payload"]["dangerousMode"], true);
    assert_eq!(update["payload"]["permissionLevel"], "ADMIN");
    assert_eq!(client.recv().await["payload"]["type"], "success");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mixed_subscribe_batch_and_fan_out() {
    let (handle, _audit) = start().await;
    let mut client = Client::connect(&handle).await;
    client.authenticate("tok-alice").await;

    client
        .send("data:subscribe", json!({ "topics": ["price:SOL", "admin:logs"] }))
        .await;
    let ok = client.recv().await;
    let denied = client.recv().await;
    assert_eq!(ok["event"], "subscription:success");
    assert_eq!(ok["payload"]["topic"], "price:SOL");
    assert_eq!(denied["event"], "subscription:error");
    assert_eq!(denied["payload"]["topic"], "admin:logs");

    let delivered = handle.ws_state().publish(&DataEvent {
        kind: DataEventKind::Price,
        topic: "price:SOL".into(),
        data: json!({ "price": 142.5 }),
    });
    assert_eq!(delivered, 1);
    let update = client.recv().await;
    assert_eq!(update["event"], "data:price_update");
    assert_eq!(update["payload"]["data"]["price"], 142.5);
    assert!(update["payload"]["timestamp"].is_u64());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_data_feed_channel_reaches_subscribers() {
    let (feed_tx, feed_rx) = mpsc::channel(16);
    let (handle, _audit) =
        start_with(gateway_config(), |cfg| cfg.data_events = Some(feed_rx)).await;
    let mut client = Client::connect(&handle).await;
    client.authenticate("tok-alice").await;

    client
        .send("data:subscribe", json!({ "topics": ["market:overview"] }))
        .await;
    assert_eq!(client.recv().await["event"], "subscription:success");

    feed_tx
        .send(DataEvent {
            kind: DataEventKind::Market,
            topic: "market:overview".into(),
            data: json!({ "volume": 1000 }),
        })
        .await
        .unwrap();
    let update = client.recv().await;
    assert_eq!(update["event"], "data:market_update");
    assert_eq!(update["payload"]["topic"], "market:overview");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_cleans_up_session() {
    let (handle, audit) = start().await;
    let mut client = Client::connect(&handle).await;
    client.authenticate("tok-alice").await;
    client
        .send("data:subscribe", json!({ "topics": ["price:SOL"] }))
        .await;
    client.recv().await;
    wait_for_sessions(&handle, 1).await;

    client.ws.close(None).await.unwrap();
    wait_for_sessions(&handle, 0).await;
    handle.ws_state().with_registry(|r| {
        assert!(!r.has_user("alice"));
        assert!(!r.has_subscribers("price:SOL"));
    });
    assert!(audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::SessionClosed { reason, .. } if reason == "disconnect")));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_frame_closes_connection() {
    let (handle, _audit) = start().await;
    let mut client = Client::connect(&handle).await;

    client
        .ws
        .send(Message::binary(vec![0u8, 1, 2]))
        .await
        .unwrap();
    let close = client.recv().await;
    assert_eq!(close["close"], 1008);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit_returns_503() {
    let mut config = gateway_config();
    config.ws.max_connections = 1;
    let (handle, _audit) = start_with(config, |_| {}).await;

    let _first = Client::connect(&handle).await;
    let err = connect_async(handle.ws_url())
        .await
        .expect_err("second connection should be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 503),
        other => panic!("unexpected error: {other}"),
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_session_is_swept() {
    let mut config = gateway_config();
    config.ws.idle_timeout_secs = 1;
    config.ws.idle_sweep_interval_secs = 1;
    let (handle, audit) = start_with(config, |cfg| cfg.spawn_background_tasks = true).await;
    let mut client = Client::connect(&handle).await;
    client.authenticate("tok-alice").await;

    let close = client.recv().await;
    assert_eq!(close["close"], 1000);
    assert_eq!(close["reason"], "idle timeout");
    wait_for_sessions(&handle, 0).await;
    assert!(audit
        .events()
        .iter()
        .any(|e| matches!(
            e,
            AuditEvent::SessionClosed { reason, .. } if reason == "idle_timeout"
        )));

    handle.shutdown().await;
}
