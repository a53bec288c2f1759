//! Crow voice-assistant server.

use clap::Parser;
use crow_server::config::ConfigHandle;
use crow_server::config::mcp::McpConfigHandle;
use crow_server::{AppState, serve};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Real-time voice-assistant orchestrator.
#[derive(Parser)]
#[command(name = "crow-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// System configuration file.
    #[arg(short, long, env = "CROW_CONFIG", default_value = "config/config.yaml")]
    config: PathBuf,

    /// MCP server configuration file.
    #[arg(
        long,
        env = "CROW_MCP_CONFIG",
        default_value = "config/mcp_server_setting.json"
    )]
    mcp_config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("crow_server={level},crow={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

async fn run(cli: Cli) -> crow_server::Result<()> {
    let cfg = ConfigHandle::load(&cli.config)?;
    cfg.watch();

    let mcp_cfg = match McpConfigHandle::load(&cli.mcp_config) {
        Ok(handle) => {
            handle.watch();
            handle
        }
        Err(e) => {
            tracing::warn!(error = %e, "no mcp server config, running with built-in tools only");
            McpConfigHandle::fixed(crow::McpServersConfig::default())
        }
    };

    serve(AppState { cfg, mcp_cfg }).await
}
