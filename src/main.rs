#![forbid(unsafe_code)]

//! `agent-relay` — tunnel host binary.
//!
//! Bootstraps configuration and logging, then listens on the local tunnel
//! socket, relaying child telemetry into tracing and answering tunneled
//! prompt requests on the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::config::GlobalConfig;
use agent_relay::prompt::frontend::TerminalFrontend;
use agent_relay::prompt::handler::InteractivePromptHandler;
use agent_relay::telemetry::TracingSink;
use agent_relay::tunnel::server::TunnelServer;
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Agent tunnel host", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the tunnel socket name from the config.
    #[arg(long)]
    socket: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay tunnel host bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
            GlobalConfig::from_toml_str(&text)?
        }
        None => GlobalConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_name = socket;
    }
    config.validate()?;
    info!(socket_name = %config.socket_name, "configuration loaded");

    // ── Start the tunnel server ─────────────────────────
    let sink = Arc::new(TracingSink);
    let handler = Arc::new(InteractivePromptHandler::new(Arc::new(
        TerminalFrontend::new(),
    )));
    let server = Arc::new(TunnelServer::new(sink).with_prompt_handler(handler));

    let cancel = CancellationToken::new();
    let listener = server.listen(&config.socket_name, &cancel)?;

    // ── Wait for shutdown signal ────────────────────────
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::Io(format!("failed to wait for ctrl-c: {err}")))?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = listener.await;

    Ok(())
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);
    let init_result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    init_result.map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}
