use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use termgate::cli::{self, Cli, Command, ConfigCommand};
use termgate::config;
use termgate::logging::{self, audit};
use termgate::server::bind::{parse_bind_mode, resolve_bind_address};
use termgate::server::ws::WsServerState;
use termgate::server::{run_server_with_config, ServerConfig};
use termgate::services::Services;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Commands { level }) => cli::handle_commands(&level),

        Some(Command::Parse { input }) => cli::handle_parse(&input),

        Some(Command::Status { port, host }) => cli::handle_status(&host, port).await,

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(logging::LogConfig::from_env())?;

    let config_path = config::get_config_path();
    let cfg = config::load_gateway_config(&config_path)?;
    info!(target: "config", path = %config_path.display(), "configuration loaded");

    let state_dir = config::resolve_state_dir();
    std::fs::create_dir_all(&state_dir)?;
    if cfg.audit.enabled {
        audit::AuditLog::init(state_dir.clone()).await;
    }

    let bind_address = resolve_bind_address(&parse_bind_mode(&cfg.gateway.bind), cfg.gateway.port)?;
    if cfg.auth.tokens.is_empty() {
        warn!(
            target: "auth",
            "no auth tokens configured; every authenticate request will be rejected"
        );
    }

    let services = Services::standalone(&cfg.auth.tokens);
    let ws_state = Arc::new(WsServerState::new(
        &cfg,
        services,
        Arc::new(audit::GlobalAuditSink),
    )?);

    let handle = run_server_with_config(ServerConfig {
        ws_state,
        bind_address,
        data_events: None,
        spawn_background_tasks: true,
    })
    .await?;
    info!(
        target: "gateway",
        "termgate {} listening on {} (state dir {})",
        env!("CARGO_PKG_VERSION"),
        handle.local_addr(),
        state_dir.display()
    );

    shutdown_signal().await;
    info!(target: "gateway", "shutdown signal received");
    handle.shutdown().await;
    info!(target: "gateway", "Gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(target: "gateway", "failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(target: "gateway", "failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
