//! Interactive terminal chat with the crow agent.
//!
//! Runs the same agent the WebSocket server uses, without the transport:
//! type a prompt, watch the streamed reply, repeat until an exit phrase.

#![allow(clippy::print_stdout)] // interactive program talks on stdout

use async_trait::async_trait;
use clap::Parser;
use crow::agent::{AgentListener, AgentProvider, ReplyState};
use crow_server::config::ConfigHandle;
use crow_server::config::mcp::McpConfigHandle;
use crow_server::server::build_agent;
use crow_server::util::remove_all_punctuation;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

/// Terminal front-end for the crow agent.
#[derive(Parser)]
#[command(name = "crow-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
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

/// Prints streamed deltas and signals the prompt loop on completion.
struct ConsoleListener {
    done: Notify,
}

#[async_trait]
impl AgentListener for ConsoleListener {
    async fn on_agent_result(&self, text: &str, state: ReplyState) -> bool {
        if !text.is_empty() {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        if state == ReplyState::Completed {
            println!();
            self.done.notify_one();
            return true;
        }
        false
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> crow_server::Result<()> {
    let cfg = ConfigHandle::load(&cli.config)?;
    let mcp_cfg = McpConfigHandle::load(&cli.mcp_config)
        .unwrap_or_else(|_| McpConfigHandle::fixed(crow::McpServersConfig::default()));

    let agent: Arc<dyn AgentProvider> = build_agent(cfg.clone(), mcp_cfg).await?;
    let listener = Arc::new(ConsoleListener {
        done: Notify::new(),
    });
    agent.set_listener(listener.clone());

    let exit_phrases = cfg.snapshot().cmd_exit.clone();
    println!("crow chat | type an exit phrase to quit\n");

    let stdin = std::io::stdin();
    loop {
        print!("you: ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        let stripped = remove_all_punctuation(prompt);
        let is_exit = exit_phrases.iter().any(|cmd| *cmd == stripped);

        print!("crow: ");
        let _ = std::io::stdout().flush();
        let wait = listener.done.notified();
        if let Err(e) = agent.run(prompt).await {
            println!();
            eprintln!("error: {e}");
        } else {
            wait.await;
        }

        if is_exit {
            break;
        }
    }
    Ok(())
}
