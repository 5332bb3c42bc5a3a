//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the gateway server
//! - `config show|path` -- inspect configuration
//! - `commands [--level L]` -- list the command registry visible at a level
//! - `parse <input>` -- show how an input line tokenizes
//! - `status` -- query a running instance's health endpoint
//! - `version` -- print version info

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::fmt::Write as _;

use crate::commands::builtin::builtin_registry;
use crate::commands::{parse, CommandRegistry, PermissionLevel};
use crate::config::{self, DEFAULT_PORT};
use crate::services::Services;

/// Terminal command gateway.
#[derive(Parser, Debug)]
#[command(
    name = "termgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "termgate: permission-gated terminal commands over WebSocket"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// List built-in commands visible at a permission level.
    Commands {
        /// PUBLIC, AUTHENTICATED, ADVANCED, ADMIN or DANGEROUS.
        #[arg(short, long, default_value = "DANGEROUS")]
        level: String,
    },

    /// Parse an input line and print the structured command as JSON.
    Parse {
        /// The raw input, e.g. `swap SOL USDC --amount 2`.
        input: String,
    },

    /// Query a running instance for health information.
    Status {
        /// Port of the running instance (default: from config or 18800).
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the loaded configuration (tokens redacted) as JSON.
    Show,

    /// Print the resolved configuration file path.
    Path,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Keys whose values are never printed, compared case-insensitively.
const SECRET_KEYS: &[&str] = &["token", "secret", "password", "apikey", "api_key"];

pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    let pretty = serde_json::to_string_pretty(&redact_secrets(cfg))?;
    println!("{}", pretty);
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

pub fn handle_commands(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level: PermissionLevel = level.parse()?;
    let registry = builtin_registry(&Services::standalone(&[]));
    print!("{}", render_commands(&registry, level));
    Ok(())
}

pub fn handle_parse(input: &str) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = parse(input);
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

/// Connect to a running instance's `/health` endpoint.
pub async fn handle_status(
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port);
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to termgate at {}:{}", host, port);
            eprintln!("  Error: {}", e);
            eprintln!();
            eprintln!("Is the server running? Start it with: termgate start");
            std::process::exit(1);
        }
    };
    if !response.status().is_success() {
        eprintln!("Health endpoint returned HTTP {}", response.status());
        std::process::exit(1);
    }

    let body: Value = response.json().await?;
    println!("termgate status");
    println!("===============");
    if let Some(version) = body.get("version").and_then(Value::as_str) {
        println!("  Version:     {}", version);
    }
    if let Some(uptime) = body.get("uptimeSecs").and_then(Value::as_u64) {
        println!("  Uptime:      {}", format_duration(uptime));
    }
    println!("  Address:     {}:{}", host, port);
    let counters = [
        ("Sessions", "sessions"),
        ("Connections", "connections"),
        ("Topics", "topics"),
    ];
    for (label, key) in counters {
        if let Some(n) = body.get(key).and_then(Value::as_u64) {
            println!("  {:<12} {}", format!("{label}:"), n);
        }
    }
    Ok(())
}

pub fn handle_version() {
    println!("termgate {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

/// One line per command: name, level, dangerous marker, usage, description.
fn render_commands(registry: &CommandRegistry, level: PermissionLevel) -> String {
    let mut out = String::new();
    for d in registry.visible(level) {
        let _ = writeln!(
            out,
            "{:<16} {:<14} {:<2} {:<48} {}",
            d.name,
            d.required_permission,
            if d.dangerous { "!" } else { "" },
            d.usage,
            d.description
        );
    }
    out
}

fn redact_secrets(mut value: Value) -> Value {
    match &mut value {
        Value::Object(map) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                if SECRET_KEYS.iter().any(|s| key.eq_ignore_ascii_case(s)) {
                    map.insert(key, Value::String("[REDACTED]".to_string()));
                } else if let Some(child) = map.remove(&key) {
                    map.insert(key, redact_secrets(child));
                }
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                *item = redact_secrets(item.take());
            }
        }
        _ => {}
    }
    value
}

/// Explicit flag, then config file, then [`DEFAULT_PORT`].
fn resolve_port(explicit: Option<u16>) -> u16 {
    if let Some(p) = explicit {
        return p;
    }
    config::load_config()
        .ok()
        .and_then(|cfg| cfg.get("gateway")?.get("port")?.as_u64())
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(DEFAULT_PORT)
}

fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
