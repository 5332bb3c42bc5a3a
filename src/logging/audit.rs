//! Structured audit logging for command execution and session security events.
//!
//! Provides a global, non-blocking audit log that writes JSONL entries to
//! `{state_dir}/audit.jsonl`. Events are sent through a bounded mpsc channel
//! and flushed to disk by a background Tokio task, so callers never block on I/O.
//!
//! # Usage
//!
//! ```no_run
//! use termgate::logging::audit::{AuditEvent, AuditLog, AuditSink, GlobalAuditSink};
//! use std::path::PathBuf;
//!
//! # async fn example() {
//! // Initialize once at startup
//! AuditLog::init(PathBuf::from("/var/lib/termgate")).await;
//!
//! // Record events from anywhere (no-ops if not initialized)
//! let _ = GlobalAuditSink.record(AuditEvent::AuthFailure {
//!     conn_id: "c-1".into(),
//!     remote_ip: "127.0.0.1".into(),
//!     reason: "invalid session token".into(),
//! });
//! # }
//! ```

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Maximum audit log file size before rotation (50 MB).
const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Bounded channel capacity for non-blocking writes.
const CHANNEL_CAPACITY: usize = 10_000;

const AUDIT_FILE_NAME: &str = "audit.jsonl";
const AUDIT_ROTATED_NAME: &str = "audit.jsonl.1";

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// Security-relevant events tracked by the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// One command execution attempt, whatever its outcome.
    CommandExecuted {
        user_id: String,
        session_id: String,
        input: String,
        success: bool,
        elapsed_ms: f64,
        dangerous: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AuthSuccess {
        conn_id: String,
        user_id: String,
        remote_ip: String,
        permission_level: String,
    },
    AuthFailure {
        conn_id: String,
        remote_ip: String,
        reason: String,
    },
    RateLimitHit {
        conn_id: String,
        user_id: String,
        input: String,
    },
    SubscriptionDenied {
        conn_id: String,
        user_id: String,
        topic: String,
    },
    SessionClosed {
        conn_id: String,
        user_id: String,
        reason: String,
    },
}

impl AuditEvent {
    /// Return the snake_case event name (matches the serde tag).
    pub fn event_name(&self) -> &'static str {
        match self {
            AuditEvent::CommandExecuted { .. } => "command_executed",
            AuditEvent::AuthSuccess { .. } => "auth_success",
            AuditEvent::AuthFailure { .. } => "auth_failure",
            AuditEvent::RateLimitHit { .. } => "rate_limit_hit",
            AuditEvent::SubscriptionDenied { .. } => "subscription_denied",
            AuditEvent::SessionClosed { .. } => "session_closed",
        }
    }
}

/// A single line in the audit JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub ts: String,
    /// Snake-case event name.
    pub event: String,
    /// Event-specific payload.
    pub data: Value,
}

impl AuditEntry {
    fn from_event(event: &AuditEvent) -> Self {
        AuditEntry {
            ts: Utc::now().to_rfc3339(),
            event: event.event_name().to_string(),
            data: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit channel full")]
    ChannelFull,
    #[error("audit writer stopped")]
    Closed,
}

/// Destination for audit events. Recording must never block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Sink that forwards to the global [`AuditLog`]; a no-op before `init`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalAuditSink;

impl AuditSink for GlobalAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        match AUDIT_LOG.get() {
            Some(log) => log.log(event),
            None => Ok(()),
        }
    }
}

/// In-memory sink, used to inspect the trail in tests and embedding code.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuditLog (global singleton)
// ---------------------------------------------------------------------------

static AUDIT_LOG: OnceLock<AuditLog> = OnceLock::new();

/// Global audit log backed by a bounded mpsc channel and a background writer.
pub struct AuditLog {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditLog {
    /// Initialize the global audit log.
    ///
    /// Spawns a background Tokio task that drains the channel and writes JSONL.
    /// Calling this more than once is a no-op (the second call is ignored).
    pub async fn init(state_dir: PathBuf) {
        if AUDIT_LOG.get().is_some() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&state_dir) {
            tracing::error!("audit: failed to create state dir: {e}");
            return;
        }

        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_CAPACITY);
        let log_path = state_dir.join(AUDIT_FILE_NAME);
        let rotated_path = state_dir.join(AUDIT_ROTATED_NAME);

        tokio::spawn(writer_task(rx, log_path, rotated_path));

        let _ = AUDIT_LOG.set(AuditLog { tx });
    }

    /// Send an event to the background writer (non-blocking best-effort).
    pub fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        let entry = AuditEntry::from_event(&event);
        // try_send so callers never block; drop if the channel is full.
        self.tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => AuditError::Closed,
        })
    }
}

// ---------------------------------------------------------------------------
// Background writer task
// ---------------------------------------------------------------------------

async fn writer_task(mut rx: mpsc::Receiver<AuditEntry>, log_path: PathBuf, rotated_path: PathBuf) {
    while let Some(entry) = rx.recv().await {
        let line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("audit: failed to serialize entry: {e}");
                continue;
            }
        };

        // Rotate before writing.
        if let Ok(meta) = fs::metadata(&log_path) {
            if meta.len() >= MAX_FILE_SIZE {
                if let Err(e) = fs::rename(&log_path, &rotated_path) {
                    tracing::error!("audit: rotation rename failed: {e}");
                }
            }
        }

        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .and_then(|mut f| writeln!(f, "{line}"));

        if let Err(e) = result {
            tracing::error!("audit: failed to write entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn command_event(input: &str, success: bool) -> AuditEvent {
        AuditEvent::CommandExecuted {
            user_id: "u-1".into(),
            session_id: "s-1".into(),
            input: input.into(),
            success,
            elapsed_ms: 1.5,
            dangerous: false,
            error: (!success).then(|| "nope".to_string()),
        }
    }

    #[test]
    fn test_event_names_unique() {
        let events = vec![
            command_event("help", true),
            AuditEvent::AuthSuccess {
                conn_id: "c".into(),
                user_id: "u".into(),
                remote_ip: "i".into(),
                permission_level: "PUBLIC".into(),
            },
            AuditEvent::AuthFailure {
                conn_id: "c".into(),
                remote_ip: "i".into(),
                reason: "r".into(),
            },
            AuditEvent::RateLimitHit {
                conn_id: "c".into(),
                user_id: "u".into(),
                input: "x".into(),
            },
            AuditEvent::SubscriptionDenied {
                conn_id: "c".into(),
                user_id: "u".into(),
                topic: "admin:logs".into(),
            },
            AuditEvent::SessionClosed {
                conn_id: "c".into(),
                user_id: "u".into(),
                reason: "idle".into(),
            },
        ];
        let mut names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_command_event_json_shape() {
        let json = serde_json::to_value(command_event("swap SOL USDC", false)).unwrap();
        assert_eq!(json["type"], "command_executed");
        assert_eq!(json["input"], "swap SOL USDC");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "nope");

        let ok = serde_json::to_value(command_event("help", true)).unwrap();
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(command_event("a", true)).unwrap();
        sink.record(command_event("b", false)).unwrap();
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], command_event("b", false));
    }

    #[test]
    fn test_global_sink_noop_without_init() {
        // Never initialized in unit tests.
        assert!(GlobalAuditSink.record(command_event("a", true)).is_ok());
    }

    #[tokio::test]
    async fn test_writer_task_appends_lines() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(AUDIT_FILE_NAME);
        let rotated_path = dir.path().join(AUDIT_ROTATED_NAME);
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(writer_task(rx, log_path.clone(), rotated_path));
        for input in ["help", "status", "whoami"] {
            tx.send(AuditEntry::from_event(&command_event(input, true)))
                .await
                .unwrap();
        }
        drop(tx);
        writer.await.unwrap();

        let entries: Vec<AuditEntry> = fs::read_to_string(&log_path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].data["input"], "whoami");
    }

    #[tokio::test]
    async fn test_writer_task_rotation() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(AUDIT_FILE_NAME);
        let rotated_path = dir.path().join(AUDIT_ROTATED_NAME);
        {
            let f = fs::File::create(&log_path).unwrap();
            f.set_len(MAX_FILE_SIZE).unwrap();
        }
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(writer_task(rx, log_path.clone(), rotated_path.clone()));
        tx.send(AuditEntry::from_event(&command_event("help", true)))
            .await
            .unwrap();
        drop(tx);
        writer.await.unwrap();

        assert!(rotated_path.exists(), "rotated file should exist");
        let content = fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("command_executed"));
    }

    #[tokio::test]
    async fn test_full_channel_reports_error() {
        let (tx, _rx) = mpsc::channel::<AuditEntry>(1);
        let log = AuditLog { tx };
        assert!(log.log(command_event("a", true)).is_ok());
        assert!(matches!(
            log.log(command_event("b", true)),
            Err(AuditError::ChannelFull)
        ));
    }
}
