//! Built-in terminal commands
//!
//! Registered once at startup by [`register_builtins`]. Mode toggles are
//! reported back as a [`ModeChange`] and applied by the socket layer.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::registry::{CommandDescriptor, CommandHandler, CommandRegistry};
use super::{
    CommandError, CommandOutput, ExecutionContext, ModeChange, OutputKind, ParsedCommand,
    PermissionLevel, ValidationResult,
};
use crate::services::{DefiService, Services};

/// Asset symbols offered by argument completion.
const KNOWN_ASSETS: [&str; 7] = ["BONK", "ETH", "JUP", "SOL", "USDC", "USDT", "WIF"];

const DEFAULT_QUOTE_ASSET: &str = "USDC";

/// Names shipped by [`register_builtins`], used for `help <name>` completion.
const BUILTIN_NAMES: [&str; 13] = [
    "ai-mode",
    "clear",
    "dangerous-mode",
    "echo",
    "help",
    "history",
    "price",
    "quote",
    "sessions",
    "status",
    "swap",
    "tx",
    "whoami",
];

pub fn builtin_registry(services: &Services) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    register_builtins(&mut registry, services);
    registry
}

pub fn register_builtins(registry: &mut CommandRegistry, services: &Services) {
    registry.register(
        CommandDescriptor::new("help", Arc::new(Help))
            .describe("List commands or describe one", "help [command]")
            .max_args(1),
    );
    registry.register(
        CommandDescriptor::new("clear", Arc::new(Clear))
            .describe("Clear the terminal", "clear")
            .max_args(0),
    );
    registry.register(
        CommandDescriptor::new("whoami", Arc::new(WhoAmI))
            .describe("Show the current identity and session toggles", "whoami")
            .max_args(0),
    );
    registry.register(
        CommandDescriptor::new("status", Arc::new(Status))
            .describe("Show gateway status", "status")
            .max_args(0),
    );
    registry.register(
        CommandDescriptor::new("echo", Arc::new(Echo))
            .describe("Print the arguments", "echo [text...]"),
    );
    registry.register(
        CommandDescriptor::new("history", Arc::new(History))
            .describe("Show recent commands of this session", "history")
            .permission(PermissionLevel::Authenticated)
            .max_args(0),
    );
    registry.register(
        CommandDescriptor::new("ai-mode", Arc::new(Toggle::Ai))
            .describe("Turn AI suggestions on or off", "ai-mode <on|off>")
            .permission(PermissionLevel::Authenticated)
            .min_args(1)
            .max_args(1),
    );
    registry.register(
        CommandDescriptor::new("price", Arc::new(Price(services.defi.clone())))
            .describe("Price of one unit of an asset", "price <asset> [quote-asset]")
            .min_args(1)
            .max_args(2),
    );
    registry.register(
        CommandDescriptor::new("quote", Arc::new(QuoteCmd(services.defi.clone())))
            .describe("Quote a swap without executing it", "quote <from> <to> --amount <n>")
            .permission(PermissionLevel::Authenticated)
            .min_args(2)
            .max_args(2),
    );
    registry.register(
        CommandDescriptor::new("tx", Arc::new(TxStatusCmd(services.defi.clone())))
            .describe("Confirmation status of a transaction", "tx <signature>")
            .permission(PermissionLevel::Authenticated)
            .min_args(1)
            .max_args(1),
    );
    registry.register(
        CommandDescriptor::new("dangerous-mode", Arc::new(Toggle::Dangerous))
            .describe("Allow or block commands that move funds", "dangerous-mode <on|off>")
            .permission(PermissionLevel::Advanced)
            .min_args(1)
            .max_args(1),
    );
    registry.register(
        CommandDescriptor::new("swap", Arc::new(Swap(services.defi.clone())))
            .describe(
                "Swap one asset for another",
                "swap <from> <to> --amount <n> [--wallet <w>] [--confirm]",
            )
            .permission(PermissionLevel::Advanced)
            .dangerous()
            .min_args(2)
            .max_args(2),
    );
    registry.register(
        CommandDescriptor::new("sessions", Arc::new(Sessions))
            .describe("List live connections", "sessions")
            .permission(PermissionLevel::Admin)
            .max_args(0),
    );
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

fn complete_from(options: &[&str], partial: &str) -> Vec<String> {
    let partial = partial.to_lowercase();
    options
        .iter()
        .filter(|option| option.to_lowercase().starts_with(&partial))
        .map(|option| option.to_string())
        .collect()
}

fn parse_toggle(value: Option<&str>) -> Option<bool> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("on") => Some(true),
        Some("off") => Some(false),
        _ => None,
    }
}

/// `--amount` must be present, numeric and positive.
fn parse_amount(parsed: &ParsedCommand) -> Result<f64, String> {
    let raw = parsed
        .flag_str("amount")
        .ok_or_else(|| "Missing --amount <n>".to_string())?;
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(format!("Invalid amount '{raw}': must be a positive number")),
    }
}

fn asset_arg(parsed: &ParsedCommand, index: usize) -> Result<String, CommandError> {
    parsed
        .arg(index)
        .map(str::to_uppercase)
        .ok_or_else(|| CommandError::InvalidArgument(format!("missing argument {}", index + 1)))
}

// ---------------------------------------------------------------------------
// Informational
// ---------------------------------------------------------------------------

struct Help;

#[async_trait]
impl CommandHandler for Help {
    async fn execute(
        &self,
        parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let level = ctx.permission_level;

        if let Some(name) = parsed.arg(0) {
            let name = name.to_lowercase();
            let descriptor = registry
                .lookup(&name)
                .filter(|d| level.satisfies(d.required_permission))
                .ok_or_else(|| CommandError::failed(format!("Unknown command: '{name}'")))?;
            let mut output = format!(
                "{} - {}\nUsage: {}\nRequires: {}",
                descriptor.name,
                descriptor.description,
                descriptor.usage,
                descriptor.required_permission
            );
            if descriptor.dangerous {
                output.push_str("\nDangerous: enable with 'dangerous-mode on' first");
            }
            return Ok(CommandOutput::text(output).with_data(json!({
                "name": descriptor.name,
                "description": descriptor.description,
                "usage": descriptor.usage,
                "permission": descriptor.required_permission,
                "dangerous": descriptor.dangerous,
            })));
        }

        let visible = registry.visible(level);
        let width = visible.iter().map(|d| d.name.len()).max().unwrap_or(0);
        let mut output = String::from("Available commands:");
        for descriptor in &visible {
            let _ = write!(output, "\n  {:width$}  {}", descriptor.name, descriptor.description);
        }
        let names: Vec<&str> = visible.iter().map(|d| d.name.as_str()).collect();
        Ok(CommandOutput::text(output).with_data(json!({ "commands": names })))
    }

    fn complete(&self, partial: &str) -> Vec<String> {
        complete_from(&BUILTIN_NAMES, partial)
    }
}

struct Clear;

#[async_trait]
impl CommandHandler for Clear {
    async fn execute(
        &self,
        _parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        Ok(CommandOutput::text("").with_data(json!({ "action": "clear" })))
    }
}

struct WhoAmI;

#[async_trait]
impl CommandHandler for WhoAmI {
    async fn execute(
        &self,
        _parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let output = format!(
            "User: {}\nSession: {}\nPermission: {}\nDangerous mode: {}\nAI mode: {}",
            ctx.user_id,
            ctx.session_id,
            ctx.permission_level,
            on_off(ctx.dangerous_mode_enabled),
            on_off(ctx.ai_mode_enabled),
        );
        Ok(CommandOutput::text(output).with_data(json!({
            "userId": ctx.user_id,
            "sessionId": ctx.session_id,
            "permissionLevel": ctx.permission_level,
            "dangerousMode": ctx.dangerous_mode_enabled,
            "aiMode": ctx.ai_mode_enabled,
        })))
    }
}

struct Status;

#[async_trait]
impl CommandHandler for Status {
    async fn execute(
        &self,
        _parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let version = env!("CARGO_PKG_VERSION");
        let (uptime_secs, sessions) = match ctx.directory {
            Some(directory) => (directory.uptime().as_secs(), directory.live_sessions().len()),
            None => (0, 0),
        };
        let output = format!(
            "termgate {version}\nUptime: {}h {}m {}s\nLive sessions: {sessions}",
            uptime_secs / 3600,
            (uptime_secs % 3600) / 60,
            uptime_secs % 60,
        );
        Ok(CommandOutput::text(output).with_data(json!({
            "version": version,
            "uptimeSecs": uptime_secs,
            "sessions": sessions,
        })))
    }
}

struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn execute(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        Ok(CommandOutput::text(parsed.arguments.join(" ")))
    }
}

struct History;

#[async_trait]
impl CommandHandler for History {
    async fn execute(
        &self,
        _parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        if ctx.history.is_empty() {
            return Ok(CommandOutput::text("No commands in history."));
        }
        let mut output = String::new();
        for (i, line) in ctx.history.iter().enumerate() {
            if i > 0 {
                output.push('\n');
            }
            let _ = write!(output, "{:>4}  {line}", i + 1);
        }
        Ok(CommandOutput::text(output).with_data(json!({ "history": ctx.history })))
    }
}

struct Sessions;

#[async_trait]
impl CommandHandler for Sessions {
    async fn execute(
        &self,
        _parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let directory = ctx
            .directory
            .ok_or_else(|| CommandError::failed("Session directory unavailable"))?;
        let sessions = directory.live_sessions();
        let mut output = format!("{} live session(s)", sessions.len());
        for s in &sessions {
            let _ = write!(
                output,
                "\n  {}  {}  {}  idle {}s  topics: {}",
                s.conn_id,
                s.user_id,
                s.permission_level,
                s.idle_secs,
                if s.topics.is_empty() {
                    "-".to_string()
                } else {
                    s.topics.join(",")
                },
            );
        }
        Ok(CommandOutput::text(output).with_data(json!({ "sessions": sessions })))
    }
}

// ---------------------------------------------------------------------------
// Session toggles
// ---------------------------------------------------------------------------

enum Toggle {
    Ai,
    Dangerous,
}

impl Toggle {
    fn name(&self) -> &'static str {
        match self {
            Toggle::Ai => "ai-mode",
            Toggle::Dangerous => "dangerous-mode",
        }
    }
}

#[async_trait]
impl CommandHandler for Toggle {
    async fn validate_args(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
    ) -> ValidationResult {
        match parse_toggle(parsed.arg(0)) {
            Some(_) => ValidationResult::ok(),
            None => ValidationResult::fail(format!("Usage: {} <on|off>", self.name())),
        }
    }

    async fn execute(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let enabled = parse_toggle(parsed.arg(0))
            .ok_or_else(|| CommandError::InvalidArgument("expected on or off".into()))?;
        let (output, change) = match (self, enabled) {
            (Toggle::Ai, true) => (
                "AI mode enabled. Suggestions will follow each command.",
                ModeChange {
                    ai_mode: Some(true),
                    ..ModeChange::default()
                },
            ),
            (Toggle::Ai, false) => (
                "AI mode disabled.",
                ModeChange {
                    ai_mode: Some(false),
                    ..ModeChange::default()
                },
            ),
            (Toggle::Dangerous, true) => (
                "Dangerous mode ENABLED. Commands such as 'swap' can now move funds.",
                ModeChange {
                    dangerous_mode: Some(true),
                    ..ModeChange::default()
                },
            ),
            (Toggle::Dangerous, false) => (
                "Dangerous mode disabled.",
                ModeChange {
                    dangerous_mode: Some(false),
                    ..ModeChange::default()
                },
            ),
        };
        Ok(CommandOutput::text(output).with_mode_change(change))
    }

    fn complete(&self, partial: &str) -> Vec<String> {
        complete_from(&["on", "off"], partial)
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

struct Price(Arc<dyn DefiService>);

#[async_trait]
impl CommandHandler for Price {
    async fn execute(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let asset = asset_arg(parsed, 0)?;
        let quote_asset = parsed
            .arg(1)
            .map(str::to_uppercase)
            .unwrap_or_else(|| DEFAULT_QUOTE_ASSET.to_string());
        let quote = self.0.get_quote(&asset, &quote_asset, 1.0).await?;
        let output = format!("1 {asset} = {} {quote_asset}", quote.out_amount);
        Ok(CommandOutput::text(output).with_data(json!({
            "asset": asset,
            "quoteAsset": quote_asset,
            "price": quote.out_amount,
        })))
    }

    fn complete(&self, partial: &str) -> Vec<String> {
        complete_from(&KNOWN_ASSETS, partial)
    }
}

struct QuoteCmd(Arc<dyn DefiService>);

#[async_trait]
impl CommandHandler for QuoteCmd {
    async fn validate_args(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
    ) -> ValidationResult {
        match parse_amount(parsed) {
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::fail(e),
        }
    }

    async fn execute(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let from = asset_arg(parsed, 0)?;
        let to = asset_arg(parsed, 1)?;
        let amount = parse_amount(parsed).map_err(CommandError::InvalidArgument)?;
        let quote = self.0.get_quote(&from, &to, amount).await?;
        let output = format!(
            "{} {} -> {} {} (price impact {:.2}%)",
            quote.in_amount,
            quote.input_asset,
            quote.out_amount,
            quote.output_asset,
            quote.price_impact_pct
        );
        Ok(CommandOutput::text(output).with_data(json!(quote)))
    }

    fn complete(&self, partial: &str) -> Vec<String> {
        complete_from(&KNOWN_ASSETS, partial)
    }
}

struct TxStatusCmd(Arc<dyn DefiService>);

#[async_trait]
impl CommandHandler for TxStatusCmd {
    async fn execute(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let signature = parsed
            .arg(0)
            .ok_or_else(|| CommandError::InvalidArgument("missing signature".into()))?;
        let status = self.0.get_status(signature).await?;
        if let Some(error) = &status.error {
            return Err(CommandError::failed(format!("Transaction {signature} failed: {error}")));
        }
        let output = if status.confirmed {
            format!("Transaction {signature}: confirmed ({} confirmations)", status.confirmations)
        } else {
            format!("Transaction {signature}: pending")
        };
        Ok(CommandOutput::text(output).with_data(json!(status)))
    }
}

struct Swap(Arc<dyn DefiService>);

#[async_trait]
impl CommandHandler for Swap {
    async fn validate_args(
        &self,
        parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
    ) -> ValidationResult {
        if let Err(e) = parse_amount(parsed) {
            return ValidationResult::fail(e);
        }
        if let Some(flag) = parsed.flag("wallet") {
            if flag.as_str().is_none() {
                return ValidationResult::fail("--wallet requires a value");
            }
        }
        if parsed.arg(0).map(str::to_uppercase) == parsed.arg(1).map(str::to_uppercase) {
            return ValidationResult::fail("Cannot swap an asset for itself");
        }
        ValidationResult::ok()
    }

    async fn execute(
        &self,
        parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        _registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError> {
        let from = asset_arg(parsed, 0)?;
        let to = asset_arg(parsed, 1)?;
        let amount = parse_amount(parsed).map_err(CommandError::InvalidArgument)?;
        let quote = self.0.get_quote(&from, &to, amount).await?;
        let summary = format!(
            "{} {} -> {} {} (price impact {:.2}%)",
            quote.in_amount,
            quote.input_asset,
            quote.out_amount,
            quote.output_asset,
            quote.price_impact_pct
        );

        if !parsed.has_flag("confirm") {
            return Ok(CommandOutput::text(format!(
                "Swap quote: {summary}\nRe-run with --confirm to execute."
            ))
            .with_data(json!(quote))
            .needs_confirmation());
        }

        ctx.push(OutputKind::System, &format!("Executing swap: {summary}"));
        let receipt = self.0.execute(&quote, parsed.flag_str("wallet")).await?;
        if !receipt.success {
            let reason = receipt.error.as_deref().unwrap_or("unknown error");
            return Err(CommandError::failed(format!("Swap failed: {reason}")));
        }
        Ok(CommandOutput::text(format!("Swap executed. Signature: {}", receipt.signature))
            .with_data(json!({ "quote": quote, "receipt": receipt })))
    }

    fn complete(&self, partial: &str) -> Vec<String> {
        complete_from(&KNOWN_ASSETS, partial)
    }
}
