//! Terminal command layer
//!
//! Turns raw terminal input into a [`ParsedCommand`], checks it against the
//! caller's [`ExecutionContext`], and dispatches it to a registered handler.
//!
//! - [`parser`] - shell-like tokenizer, never fails
//! - [`registry`] - static name -> descriptor table
//! - [`validator`] - ordered permission / mode / arity checks
//! - [`executor`] - dispatch, latency measurement, audit trail
//! - [`builtin`] - the gateway's built-in command set

pub mod builtin;
pub mod executor;
pub mod parser;
pub mod registry;
pub mod validator;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use executor::CommandProcessor;
pub use parser::parse;
pub use registry::{CommandDescriptor, CommandHandler, CommandRegistry};
pub use validator::validate;

/// Ordered permission levels. Comparison follows declaration order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    #[default]
    Public,
    Authenticated,
    Advanced,
    Admin,
    Dangerous,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 5] = [
        PermissionLevel::Public,
        PermissionLevel::Authenticated,
        PermissionLevel::Advanced,
        PermissionLevel::Admin,
        PermissionLevel::Dangerous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Public => "PUBLIC",
            PermissionLevel::Authenticated => "AUTHENTICATED",
            PermissionLevel::Advanced => "ADVANCED",
            PermissionLevel::Admin => "ADMIN",
            PermissionLevel::Dangerous => "DANGEROUS",
        }
    }

    /// Whether this level satisfies a `required` level.
    pub fn satisfies(&self, required: PermissionLevel) -> bool {
        *self >= required
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown permission level: {0}")]
pub struct UnknownPermissionLevel(pub String);

impl FromStr for PermissionLevel {
    type Err = UnknownPermissionLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPermissionLevel(s.to_string()))
    }
}

/// Value of a parsed flag: `--key value` carries a string, `--key` or `-k`
/// alone is presence-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Value(String),
    Present(bool),
}

impl FlagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Value(v) => Some(v),
            FlagValue::Present(_) => None,
        }
    }
}

/// Structured form of one submitted input line. Never mutated after parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedCommand {
    /// Lowercased command name (empty when the input had no tokens).
    pub command: String,
    /// Lowercased second token, when that token is not a flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<String>,
    /// Positional arguments in order (everything after the command name that
    /// is neither a flag nor a consumed flag value).
    pub arguments: Vec<String>,
    pub flags: BTreeMap<String, FlagValue>,
    /// Original input, kept for audit and echo.
    pub raw: String,
}

impl ParsedCommand {
    pub fn flag(&self, name: &str) -> Option<&FlagValue> {
        self.flags.get(name)
    }

    /// String value of a `--name value` flag.
    pub fn flag_str(&self, name: &str) -> Option<&str> {
        self.flags.get(name).and_then(FlagValue::as_str)
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.arguments.get(index).map(String::as_str)
    }
}

/// Session toggles changed by a command. Applied by the session owner, never
/// by the handler itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeChange {
    pub dangerous_mode: Option<bool>,
    pub ai_mode: Option<bool>,
}

/// What a handler hands back on success.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub output: String,
    pub data: Option<Value>,
    pub requires_confirmation: bool,
    pub mode_change: Option<ModeChange>,
}

impl CommandOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn needs_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_mode_change(mut self, change: ModeChange) -> Self {
        self.mode_change = Some(change);
        self
    }
}

/// Handler failure. Converted into a `success=false` [`CommandResult`] at the
/// executor boundary.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Service(#[from] crate::services::ServiceError),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        CommandError::Failed(message.into())
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dangerous: Option<bool>,
    #[serde(skip)]
    pub mode_change: Option<ModeChange>,
}

impl CommandResult {
    pub(crate) fn failure(message: String, elapsed: Duration, dangerous: bool) -> Self {
        Self {
            success: false,
            output: message.clone(),
            execution_time_ms: elapsed.as_secs_f64() * 1000.0,
            error: Some(message),
            dangerous: dangerous.then_some(true),
            ..Self::default()
        }
    }

    pub(crate) fn from_output(output: CommandOutput, elapsed: Duration, dangerous: bool) -> Self {
        Self {
            success: true,
            output: output.output,
            execution_time_ms: elapsed.as_secs_f64() * 1000.0,
            data: output.data,
            error: None,
            requires_confirmation: output.requires_confirmation.then_some(true),
            dangerous: dangerous.then_some(true),
            mode_change: output.mode_change,
        }
    }
}

/// Verdict of [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Kind tag of a `terminal:output` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Command,
    Success,
    Error,
    System,
}

/// Push channel back to the live connection, for handlers that report
/// progress before their final result.
pub trait OutputSink: Send + Sync {
    fn push(&self, kind: OutputKind, content: &str);
}

/// Summary of one live connection, as shown to admins.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub conn_id: String,
    pub user_id: String,
    pub permission_level: PermissionLevel,
    pub dangerous_mode: bool,
    pub ai_mode: bool,
    pub topics: Vec<String>,
    pub idle_secs: u64,
}

/// Read-only view of the gateway for introspection commands.
pub trait SessionDirectory: Send + Sync {
    fn live_sessions(&self) -> Vec<SessionSummary>;
    fn uptime(&self) -> Duration;
}

/// Per-invocation caller context. Built fresh for each command.
#[derive(Clone)]
pub struct ExecutionContext<'a> {
    pub user_id: String,
    pub session_id: String,
    pub permission_level: PermissionLevel,
    pub dangerous_mode_enabled: bool,
    pub ai_mode_enabled: bool,
    pub output: Option<&'a dyn OutputSink>,
    pub directory: Option<&'a dyn SessionDirectory>,
    pub history: &'a [String],
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        permission_level: PermissionLevel,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            permission_level,
            dangerous_mode_enabled: false,
            ai_mode_enabled: false,
            output: None,
            directory: None,
            history: &[],
        }
    }

    pub fn with_modes(mut self, dangerous_mode: bool, ai_mode: bool) -> Self {
        self.dangerous_mode_enabled = dangerous_mode;
        self.ai_mode_enabled = ai_mode;
        self
    }

    pub fn with_output(mut self, output: &'a dyn OutputSink) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_directory(mut self, directory: &'a dyn SessionDirectory) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_history(mut self, history: &'a [String]) -> Self {
        self.history = history;
        self
    }

    /// Push an incremental line to the caller, if a connection is attached.
    pub fn push(&self, kind: OutputKind, content: &str) {
        if let Some(output) = self.output {
            output.push(kind, content);
        }
    }
}

impl fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("permission_level", &self.permission_level)
            .field("dangerous_mode_enabled", &self.dangerous_mode_enabled)
            .field("ai_mode_enabled", &self.ai_mode_enabled)
            .field("output", &self.output.map(|_| ".."))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ordering() {
        assert!(PermissionLevel::Public < PermissionLevel::Authenticated);
        assert!(PermissionLevel::Authenticated < PermissionLevel::Advanced);
        assert!(PermissionLevel::Advanced < PermissionLevel::Admin);
        assert!(PermissionLevel::Admin < PermissionLevel::Dangerous);
        assert!(PermissionLevel::Admin.satisfies(PermissionLevel::Advanced));
        assert!(!PermissionLevel::Public.satisfies(PermissionLevel::Authenticated));
    }

    #[test]
    fn test_permission_parse_and_display() {
        assert_eq!(
            "admin".parse::<PermissionLevel>().unwrap(),
            PermissionLevel::Admin
        );
        assert_eq!(
            " Advanced ".parse::<PermissionLevel>().unwrap(),
            PermissionLevel::Advanced
        );
        assert!("root".parse::<PermissionLevel>().is_err());
        assert_eq!(PermissionLevel::Dangerous.to_string(), "DANGEROUS");
    }

    #[test]
    fn test_permission_serde() {
        let json = serde_json::to_string(&PermissionLevel::Authenticated).unwrap();
        assert_eq!(json, "\"AUTHENTICATED\"");
        let level: PermissionLevel = serde_json::from_str("\"ADMIN\"").unwrap();
        assert_eq!(level, PermissionLevel::Admin);
    }

    #[test]
    fn test_flag_value_serializes_untagged() {
        let mut flags = BTreeMap::new();
        flags.insert("amount".to_string(), FlagValue::Value("5".into()));
        flags.insert("y".to_string(), FlagValue::Present(true));
        let value = serde_json::to_value(&flags).unwrap();
        assert_eq!(value, serde_json::json!({"amount": "5", "y": true}));
    }

    #[test]
    fn test_command_result_failure_shape() {
        let result =
            CommandResult::failure("boom".to_string(), Duration::from_millis(3), true);
        assert!(!result.success);
        assert_eq!(result.output, "boom");
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.dangerous, Some(true));
        assert!(result.execution_time_ms >= 3.0);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("requiresConfirmation").is_none());
        assert_eq!(json["executionTimeMs"].as_f64().map(|v| v >= 3.0), Some(true));
    }

    #[test]
    fn test_command_result_from_output_carries_mode_change() {
        let output = CommandOutput::text("ok")
            .needs_confirmation()
            .with_mode_change(ModeChange {
                dangerous_mode: Some(true),
                ai_mode: None,
            });
        let result = CommandResult::from_output(output, Duration::ZERO, false);
        assert!(result.success);
        assert_eq!(result.requires_confirmation, Some(true));
        assert_eq!(result.dangerous, None);
        assert_eq!(
            result.mode_change.and_then(|m| m.dangerous_mode),
            Some(true)
        );
    }
}
