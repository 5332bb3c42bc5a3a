//! Configuration parsing module
//!
//! Handles JSON5 configuration with environment variable substitution and a
//! typed, fully-defaulted [`GatewayConfig`] view.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::commands::PermissionLevel;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid config shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

pub const DEFAULT_PORT: u16 = 18800;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_MAX_PER_IP: usize = 32;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const DEFAULT_COMMAND_RATE: f64 = 5.0;
pub const DEFAULT_COMMAND_BURST: f64 = 20.0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_IDLE_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HISTORY_SIZE: usize = 20;

/// Get the config file path.
/// Priority: TERMGATE_CONFIG_PATH > TERMGATE_STATE_DIR/termgate.json5 > ~/.termgate/termgate.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("TERMGATE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    resolve_state_dir().join("termgate.json5")
}

/// State directory for the audit trail: TERMGATE_STATE_DIR or ~/.termgate
pub fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("TERMGATE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".termgate")
}

/// Load the raw config value from the default path.
/// Returns an empty object if the file doesn't exist.
pub fn load_config() -> Result<Value, ConfigError> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;
    Ok(value)
}

/// Load, type and validate the gateway config.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let value = load_config_from(path)?;
    let config = GatewayConfig::from_value(value)?;
    tracing::debug!(target: "config", path = %path.display(), "config loaded");
    Ok(config)
}

fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").unwrap());

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = name.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Typed view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub gateway: ListenConfig,
    pub ws: WsConfig,
    pub topics: TopicsConfig,
    pub auth: AuthConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenConfig {
    /// `loopback`, `any`, or a literal IP address.
    pub bind: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: "loopback".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WsConfig {
    pub max_connections: usize,
    pub max_per_ip: usize,
    pub max_payload_bytes: usize,
    /// Sustained commands per second per connection.
    pub command_rate: f64,
    pub command_burst: f64,
    pub idle_timeout_secs: u64,
    pub idle_sweep_interval_secs: u64,
    /// Recent command lines kept per session.
    pub history_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_per_ip: DEFAULT_MAX_PER_IP,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            command_rate: DEFAULT_COMMAND_RATE,
            command_burst: DEFAULT_COMMAND_BURST,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            idle_sweep_interval_secs: DEFAULT_IDLE_SWEEP_INTERVAL_SECS,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRuleConfig {
    pub pattern: String,
    pub permission: PermissionLevel,
}

impl TopicRuleConfig {
    pub fn new(pattern: &str, permission: PermissionLevel) -> Self {
        Self {
            pattern: pattern.to_string(),
            permission,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Evaluated in order; first match wins.
    pub rules: Vec<TopicRuleConfig>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                TopicRuleConfig::new("price:*", PermissionLevel::Public),
                TopicRuleConfig::new("market:*", PermissionLevel::Public),
                TopicRuleConfig::new("token:*", PermissionLevel::Authenticated),
                TopicRuleConfig::new("trade:*", PermissionLevel::Advanced),
                TopicRuleConfig::new("admin:*", PermissionLevel::Admin),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub permission: PermissionLevel,
    #[serde(default)]
    pub dangerous_mode: bool,
    #[serde(default)]
    pub ai_mode: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl GatewayConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(path: &str, message: impl Into<String>) -> ConfigError {
            ConfigError::ValidationError {
                path: path.to_string(),
                message: message.into(),
            }
        }

        let ws = &self.ws;
        if !(ws.command_rate.is_finite() && ws.command_rate > 0.0) {
            return Err(invalid("ws.commandRate", "must be a positive number"));
        }
        if !(ws.command_burst.is_finite() && ws.command_burst >= 1.0) {
            return Err(invalid("ws.commandBurst", "must be at least 1"));
        }
        if ws.max_connections == 0 {
            return Err(invalid("ws.maxConnections", "must be greater than 0"));
        }
        if ws.max_per_ip == 0 {
            return Err(invalid("ws.maxPerIp", "must be greater than 0"));
        }
        if ws.max_payload_bytes == 0 {
            return Err(invalid("ws.maxPayloadBytes", "must be greater than 0"));
        }
        if ws.idle_sweep_interval_secs == 0 {
            return Err(invalid("ws.idleSweepIntervalSecs", "must be greater than 0"));
        }

        for (i, rule) in self.topics.rules.iter().enumerate() {
            if !is_valid_topic_glob(&rule.pattern) {
                return Err(invalid(
                    &format!("topics.rules[{i}].pattern"),
                    format!("invalid topic pattern '{}'", rule.pattern),
                ));
            }
        }

        for (i, token) in self.auth.tokens.iter().enumerate() {
            if token.token.is_empty() || token.user_id.is_empty() {
                return Err(invalid(
                    &format!("auth.tokens[{i}]"),
                    "token and userId must be non-empty",
                ));
            }
        }
        Ok(())
    }
}

/// Topic globs: non-empty, `*` and `?` wildcards, no whitespace.
pub fn is_valid_topic_glob(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern
            .chars()
            .all(|c| {
                c.is_ascii_alphanumeric() || matches!(c, ':' | '*' | '?' | '_' | '-' | '.' | '/')
            })
}
