//! Inbound event handlers.
//!
//! Each handler touches the session registry only inside short
//! `with_registry` closures; collaborator calls and command execution run
//! with no lock held.

use axum::extract::ws::Message;
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::registry::{ConnectedSession, ModeSnapshot};
use super::topics::TopicDecision;
use super::{
    now_ms, send_close, send_event, send_state_update, send_terminal_output, ConnectionContext,
    ConnectionOutput, InboundFrame, LoopSignal, WsServerState, CLOSE_POLICY_VIOLATION,
};
use crate::commands::{parse, ExecutionContext, OutputKind};
use crate::logging::audit::AuditEvent;
use crate::server::ratelimit::CommandRateLimiter;

type Tx = mpsc::UnboundedSender<Message>;

/// Copy of the session fields a handler needs once the lock is released.
#[derive(Debug, Clone)]
struct SessionView {
    user_id: String,
    session_id: String,
    modes: ModeSnapshot,
    history: Vec<String>,
}

pub(super) async fn dispatch_event(
    state: &Arc<WsServerState>,
    conn: &mut ConnectionContext,
    tx: &Tx,
    frame: InboundFrame,
) -> LoopSignal {
    let InboundFrame { event, payload } = frame;
    match event.as_str() {
        "authenticate" => return handle_authenticate(state, conn, tx, &payload).await,
        "terminal:command" | "terminal:complete" | "data:subscribe" | "data:unsubscribe"
        | "ai:request" | "ping" => {}
        other => {
            tracing::debug!(target: "ws", conn_id = %conn.conn_id, event = other, "unknown event");
            send_terminal_output(
                state,
                tx,
                OutputKind::Error,
                &format!("Unknown event '{other}'"),
                None,
            );
            return LoopSignal::Continue;
        }
    }

    let view = if conn.authenticated {
        touch_session(state, &conn.conn_id)
    } else {
        None
    };
    let Some(view) = view else {
        send_terminal_output(state, tx, OutputKind::Error, "Not authenticated", None);
        return LoopSignal::Continue;
    };

    match event.as_str() {
        "terminal:command" => handle_command(state, conn, tx, &payload).await,
        "terminal:complete" => handle_complete(state, tx, &view, &payload),
        "data:subscribe" => handle_subscribe(state, conn, tx, &view, &payload),
        "data:unsubscribe" => handle_unsubscribe(state, conn, tx, &payload),
        "ai:request" => handle_ai_request(state, tx, &view, &payload).await,
        _ => send_event(state, tx, "pong", json!({ "ts": now_ms() })),
    }
    LoopSignal::Continue
}

/// Refresh `last_activity` and snapshot the session.
fn touch_session(state: &WsServerState, conn_id: &str) -> Option<SessionView> {
    state.with_registry(|registry| {
        registry.touch(conn_id, Instant::now());
        registry.get(conn_id).map(|session| SessionView {
            user_id: session.user_id.clone(),
            session_id: session.session_id.clone(),
            modes: session.modes(),
            history: session.recent_commands.iter().cloned().collect(),
        })
    })
}

// ---------------------------------------------------------------------------
// authenticate
// ---------------------------------------------------------------------------

async fn handle_authenticate(
    state: &WsServerState,
    conn: &mut ConnectionContext,
    tx: &Tx,
    payload: &Value,
) -> LoopSignal {
    if conn.authenticated {
        send_event(state, tx, "auth:error", json!({ "message": "already authenticated" }));
        return LoopSignal::Continue;
    }

    let token = payload
        .get("token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty());
    let Some(token) = token else {
        return reject_auth(state, conn, tx, "missing token");
    };

    let record = match state.services.sessions.validate_session_token(token).await {
        Ok(Some(record)) => record,
        Ok(None) => return reject_auth(state, conn, tx, "invalid session token"),
        Err(e) => {
            tracing::warn!(
                target: "auth",
                conn_id = %conn.conn_id,
                error = %e,
                "session lookup failed"
            );
            return reject_auth(state, conn, tx, "session service unavailable");
        }
    };
    let user = match state.services.sessions.get_user(&record.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return reject_auth(state, conn, tx, "user not found"),
        Err(e) => {
            tracing::warn!(
                target: "auth",
                conn_id = %conn.conn_id,
                error = %e,
                "user lookup failed"
            );
            return reject_auth(state, conn, tx, "session service unavailable");
        }
    };

    let now = Instant::now();
    let session = ConnectedSession {
        conn_id: conn.conn_id.clone(),
        user_id: user.id.clone(),
        session_id: record.session_id.clone(),
        permission_level: user.permission_level,
        dangerous_mode: user.dangerous_mode_enabled,
        ai_mode: user.ai_mode_preference,
        topics: BTreeSet::new(),
        rate_limiter: CommandRateLimiter::new(
            state.config.command_rate,
            state.config.command_burst,
        ),
        connected_at: now,
        last_activity: now,
        recent_commands: VecDeque::new(),
        tx: tx.clone(),
        cancel: conn.cancel.clone(),
    };
    let modes = session.modes();
    state.with_registry(|registry| registry.insert(session));
    conn.authenticated = true;

    tracing::info!(
        target: "auth",
        conn_id = %conn.conn_id,
        user_id = %user.id,
        level = %modes.permission_level,
        "authenticated"
    );
    state.audit(AuditEvent::AuthSuccess {
        conn_id: conn.conn_id.clone(),
        user_id: user.id.clone(),
        remote_ip: conn.remote_ip.clone(),
        permission_level: modes.permission_level.to_string(),
    });

    send_event(
        state,
        tx,
        "auth:success",
        json!({
            "userId": user.id,
            "sessionId": record.session_id,
            "connId": conn.conn_id,
            "permissionLevel": modes.permission_level,
            "dangerousMode": modes.dangerous_mode,
            "aiMode": modes.ai_mode,
        }),
    );
    send_state_update(state, tx, modes);
    LoopSignal::Continue
}

/// Report the failure, then close. The connection never gets a session.
fn reject_auth(
    state: &WsServerState,
    conn: &ConnectionContext,
    tx: &Tx,
    reason: &str,
) -> LoopSignal {
    tracing::warn!(
        target: "auth",
        conn_id = %conn.conn_id,
        remote = %conn.remote_ip,
        reason,
        "authentication failed"
    );
    state.audit(AuditEvent::AuthFailure {
        conn_id: conn.conn_id.clone(),
        remote_ip: conn.remote_ip.clone(),
        reason: reason.to_string(),
    });
    send_event(state, tx, "auth:error", json!({ "message": reason }));
    let _ = send_close(tx, CLOSE_POLICY_VIOLATION, reason);
    LoopSignal::Break
}

// ---------------------------------------------------------------------------
// terminal:command / terminal:complete
// ---------------------------------------------------------------------------

enum Admission {
    Admitted(SessionView),
    Limited { user_id: String, retry_secs: u64 },
}

async fn handle_command(
    state: &Arc<WsServerState>,
    conn: &ConnectionContext,
    tx: &Tx,
    payload: &Value,
) {
    let line = payload
        .get("command")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if line.is_empty() {
        send_terminal_output(state, tx, OutputKind::Error, "Missing command", None);
        return;
    }

    let admission = state.with_registry(|registry| {
        let session = registry.get_mut(&conn.conn_id)?;
        if !session.rate_limiter.check() {
            return Some(Admission::Limited {
                user_id: session.user_id.clone(),
                retry_secs: session.rate_limiter.retry_after_secs().max(1),
            });
        }
        Some(Admission::Admitted(SessionView {
            user_id: session.user_id.clone(),
            session_id: session.session_id.clone(),
            modes: session.modes(),
            history: session.recent_commands.iter().cloned().collect(),
        }))
    });
    let view = match admission {
        Some(Admission::Admitted(view)) => view,
        Some(Admission::Limited { user_id, retry_secs }) => {
            tracing::debug!(
                target: "ws",
                conn_id = %conn.conn_id,
                user_id = %user_id,
                "command rate limited"
            );
            state.audit(AuditEvent::RateLimitHit {
                conn_id: conn.conn_id.clone(),
                user_id,
                input: line.to_string(),
            });
            send_terminal_output(
                state,
                tx,
                OutputKind::Error,
                &format!("Rate limit exceeded. Try again in {retry_secs}s."),
                None,
            );
            return;
        }
        None => {
            send_terminal_output(state, tx, OutputKind::Error, "Not authenticated", None);
            return;
        }
    };

    send_terminal_output(state, tx, OutputKind::Command, line, None);

    let parsed = parse(line);
    let output = ConnectionOutput { state: &**state, tx };
    let ctx = ExecutionContext::new(&view.user_id, &view.session_id, view.modes.permission_level)
        .with_modes(view.modes.dangerous_mode, view.modes.ai_mode)
        .with_output(&output)
        .with_directory(&**state)
        .with_history(&view.history);
    let result = state.processor.execute(&parsed, &ctx).await;

    let history_size = state.config.history_size;
    let (modes, history) = state.with_registry(|registry| {
        let modes = result
            .mode_change
            .and_then(|change| registry.apply_mode_change(&conn.conn_id, change));
        registry.record_command(&conn.conn_id, line, history_size);
        let history: Option<Vec<String>> = registry
            .get(&conn.conn_id)
            .filter(|session| session.ai_mode)
            .map(|session| session.recent_commands.iter().cloned().collect());
        (modes, history)
    });
    if let Some(modes) = modes {
        send_state_update(state, tx, modes);
    }

    let kind = if result.success {
        OutputKind::Success
    } else {
        OutputKind::Error
    };
    let serialized = serde_json::to_value(&result).ok();
    send_terminal_output(state, tx, kind, &result.output, serialized);

    if let Some(history) = history {
        spawn_prediction(state.clone(), tx.clone(), view.user_id, history);
    }
}

/// Best-effort suggestions after a command. Failures never reach the client.
fn spawn_prediction(state: Arc<WsServerState>, tx: Tx, user_id: String, history: Vec<String>) {
    tokio::spawn(async move {
        match state.services.ai.predict_next_commands(&user_id, &history).await {
            Ok(suggestions) if suggestions.is_empty() => {}
            Ok(suggestions) => {
                send_event(&state, &tx, "ai:suggestions", json!({ "suggestions": suggestions }));
            }
            Err(e) => {
                tracing::warn!(
                    target: "ws",
                    user_id = %user_id,
                    error = %e,
                    "command prediction failed"
                );
            }
        }
    });
}

fn handle_complete(state: &WsServerState, tx: &Tx, view: &SessionView, payload: &Value) {
    let input = payload.get("input").and_then(Value::as_str).unwrap_or_default();
    let suggestions = state
        .processor
        .registry()
        .complete(input, view.modes.permission_level);
    send_event(
        state,
        tx,
        "terminal:completions",
        json!({ "input": input, "suggestions": suggestions }),
    );
}

// ---------------------------------------------------------------------------
// data:subscribe / data:unsubscribe
// ---------------------------------------------------------------------------

/// Each entry of the `topics` array; non-string entries are kept as their raw
/// value so they can be rejected individually.
fn requested_topics(payload: &Value) -> Option<Vec<Result<String, Value>>> {
    let topics = payload.get("topics")?.as_array()?;
    Some(
        topics
            .iter()
            .map(|entry| match entry {
                Value::String(topic) => Ok(topic.clone()),
                other => Err(other.clone()),
            })
            .collect(),
    )
}

fn reject_malformed_topic(state: &WsServerState, tx: &Tx, raw: Value) {
    send_event(
        state,
        tx,
        "subscription:error",
        json!({ "topic": raw, "message": "topic must be a string" }),
    );
}

fn handle_subscribe(
    state: &WsServerState,
    conn: &ConnectionContext,
    tx: &Tx,
    view: &SessionView,
    payload: &Value,
) {
    let Some(topics) = requested_topics(payload) else {
        send_terminal_output(
            state,
            tx,
            OutputKind::Error,
            "data:subscribe requires a topics array",
            None,
        );
        return;
    };

    for entry in topics {
        let topic = match entry {
            Ok(topic) => topic,
            Err(raw) => {
                reject_malformed_topic(state, tx, raw);
                continue;
            }
        };
        let denial = match state.topic_policy.check(&topic, view.modes.permission_level) {
            TopicDecision::Allowed => {
                if state.with_registry(|registry| registry.subscribe(&conn.conn_id, &topic)) {
                    tracing::debug!(
                        target: "ws",
                        conn_id = %conn.conn_id,
                        topic = %topic,
                        "subscribed"
                    );
                    send_event(state, tx, "subscription:success", json!({ "topic": topic }));
                    continue;
                }
                "Session closed".to_string()
            }
            TopicDecision::Insufficient(required) => format!(
                "Insufficient permissions for '{topic}': requires {required}, you have {}",
                view.modes.permission_level
            ),
            TopicDecision::NoRule => format!("No subscription rule matches '{topic}'"),
        };
        state.audit(AuditEvent::SubscriptionDenied {
            conn_id: conn.conn_id.clone(),
            user_id: view.user_id.clone(),
            topic: topic.clone(),
        });
        send_event(
            state,
            tx,
            "subscription:error",
            json!({ "topic": topic, "message": denial }),
        );
    }
}

fn handle_unsubscribe(state: &WsServerState, conn: &ConnectionContext, tx: &Tx, payload: &Value) {
    let Some(topics) = requested_topics(payload) else {
        send_terminal_output(
            state,
            tx,
            OutputKind::Error,
            "data:unsubscribe requires a topics array",
            None,
        );
        return;
    };
    for entry in topics {
        let topic = match entry {
            Ok(topic) => topic,
            Err(raw) => {
                reject_malformed_topic(state, tx, raw);
                continue;
            }
        };
        state.with_registry(|registry| registry.unsubscribe(&conn.conn_id, &topic));
        send_event(
            state,
            tx,
            "subscription:success",
            json!({ "topic": topic, "message": "unsubscribed" }),
        );
    }
}

// ---------------------------------------------------------------------------
// ai:request
// ---------------------------------------------------------------------------

async fn handle_ai_request(state: &WsServerState, tx: &Tx, view: &SessionView, payload: &Value) {
    let ai_error = |message: String| {
        send_event(state, tx, "ai:error", json!({ "message": message }));
    };

    if !view.modes.ai_mode {
        ai_error("AI mode is disabled. Enable it with 'ai-mode on'.".to_string());
        return;
    }

    let request_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();
    let content = payload.get("content").and_then(Value::as_str).unwrap_or_default();
    match request_type {
        "suggest" => match state
            .services
            .ai
            .predict_next_commands(&view.user_id, &view.history)
            .await
        {
            Ok(suggestions) => {
                send_event(state, tx, "ai:suggestions", json!({ "suggestions": suggestions }));
            }
            Err(e) => ai_error(e.to_string()),
        },
        "explain" => match state.services.ai.explain_command(content).await {
            Ok(explanation) => send_event(
                state,
                tx,
                "ai:explanation",
                json!({ "content": content, "explanation": explanation }),
            ),
            Err(e) => ai_error(e.to_string()),
        },
        other => ai_error(format!("Unknown AI request type '{other}'")),
    }
}
