//! `GET /health` liveness report.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::commands::SessionDirectory;
use crate::server::ws::WsServerState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// Authenticated sessions.
    pub sessions: usize,
    /// Open sockets, authenticated or not.
    pub connections: usize,
    pub topics: usize,
}

impl HealthReport {
    pub fn gather(state: &WsServerState) -> Self {
        let (sessions, topics) = state.with_registry(|r| (r.len(), r.topic_count()));
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: state.uptime().as_secs(),
            sessions,
            connections: state.connection_tracker.total(),
            topics,
        }
    }
}

pub async fn health_handler(State(state): State<Arc<WsServerState>>) -> Json<HealthReport> {
    Json(HealthReport::gather(&state))
}
