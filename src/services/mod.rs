//! External collaborators
//!
//! The command and socket layers only see these traits. Session/user lookup,
//! blockchain quotes and AI prediction are implemented elsewhere; the
//! implementations shipped here are the ones a standalone gateway can run
//! with.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::commands::PermissionLevel;
use crate::config::TokenConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0} service not configured")]
    NotConfigured(&'static str),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Session / user
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub permission_level: PermissionLevel,
    pub dangerous_mode_enabled: bool,
    pub ai_mode_preference: bool,
}

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn validate_session_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, ServiceError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, ServiceError>;
}

/// Token table loaded from the `auth.tokens` config section.
#[derive(Debug, Default)]
pub struct StaticSessionService {
    sessions: HashMap<String, SessionRecord>,
    users: HashMap<String, UserRecord>,
}

impl StaticSessionService {
    pub fn new(tokens: &[TokenConfig]) -> Self {
        let mut service = Self::default();
        for entry in tokens {
            service.sessions.insert(
                entry.token.clone(),
                SessionRecord {
                    session_id: format!("static-{}", entry.user_id),
                    user_id: entry.user_id.clone(),
                },
            );
            service.users.insert(
                entry.user_id.clone(),
                UserRecord {
                    id: entry.user_id.clone(),
                    permission_level: entry.permission,
                    dangerous_mode_enabled: entry.dangerous_mode,
                    ai_mode_preference: entry.ai_mode,
                },
            );
        }
        service
    }
}

#[async_trait]
impl SessionService for StaticSessionService {
    async fn validate_session_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, ServiceError> {
        Ok(self.sessions.get(token).cloned())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, ServiceError> {
        Ok(self.users.get(user_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Blockchain / DeFi
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub input_asset: String,
    pub output_asset: String,
    pub in_amount: f64,
    pub out_amount: f64,
    #[serde(default)]
    pub price_impact_pct: f64,
    /// Opaque route data returned by the aggregator.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub route: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReceipt {
    pub signature: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStatus {
    pub confirmed: bool,
    pub confirmations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait DefiService: Send + Sync {
    async fn get_quote(
        &self,
        input_asset: &str,
        output_asset: &str,
        amount: f64,
    ) -> Result<Quote, ServiceError>;
    async fn execute(
        &self,
        quote: &Quote,
        wallet: Option<&str>,
    ) -> Result<ExecutionReceipt, ServiceError>;
    async fn get_status(&self, signature: &str) -> Result<TxStatus, ServiceError>;
}

/// Placeholder used when no chain backend is wired in. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredDefi;

#[async_trait]
impl DefiService for UnconfiguredDefi {
    async fn get_quote(
        &self,
        _input: &str,
        _output: &str,
        _amount: f64,
    ) -> Result<Quote, ServiceError> {
        Err(ServiceError::NotConfigured("blockchain"))
    }

    async fn execute(
        &self,
        _quote: &Quote,
        _wallet: Option<&str>,
    ) -> Result<ExecutionReceipt, ServiceError> {
        Err(ServiceError::NotConfigured("blockchain"))
    }

    async fn get_status(&self, _signature: &str) -> Result<TxStatus, ServiceError> {
        Err(ServiceError::NotConfigured("blockchain"))
    }
}

// ---------------------------------------------------------------------------
// AI
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AiService: Send + Sync {
    async fn predict_next_commands(
        &self,
        user_id: &str,
        recent: &[String],
    ) -> Result<Vec<String>, ServiceError>;
    async fn explain_command(&self, content: &str) -> Result<String, ServiceError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAi;

#[async_trait]
impl AiService for NoopAi {
    async fn predict_next_commands(
        &self,
        _user_id: &str,
        _recent: &[String],
    ) -> Result<Vec<String>, ServiceError> {
        Ok(Vec::new())
    }

    async fn explain_command(&self, _content: &str) -> Result<String, ServiceError> {
        Err(ServiceError::NotConfigured("ai"))
    }
}

/// Collaborators shared by command handlers and the socket layer.
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<dyn SessionService>,
    pub defi: Arc<dyn DefiService>,
    pub ai: Arc<dyn AiService>,
}

impl Services {
    pub fn new(
        sessions: Arc<dyn SessionService>,
        defi: Arc<dyn DefiService>,
        ai: Arc<dyn AiService>,
    ) -> Self {
        Self { sessions, defi, ai }
    }

    /// Static token table, no chain backend, no AI.
    pub fn standalone(tokens: &[TokenConfig]) -> Self {
        Self::new(
            Arc::new(StaticSessionService::new(tokens)),
            Arc::new(UnconfiguredDefi),
            Arc::new(NoopAi),
        )
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Data feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEventKind {
    Price,
    Market,
    Token,
}

impl DataEventKind {
    /// Outbound event name used for fan-out.
    pub fn event_name(&self) -> &'static str {
        match self {
            DataEventKind::Price => "data:price_update",
            DataEventKind::Market => "data:market_update",
            DataEventKind::Token => "data:token_event",
        }
    }
}

/// One upstream event tagged with the topic it fans out to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub kind: DataEventKind,
    pub topic: String,
    pub data: Value,
}
