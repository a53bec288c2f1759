//! WebSocket server: accepts clients on `/crow/v1` and hands each
//! connection to its own [`Session`].

use crate::asr::{AsrProvider, Paraformer};
use crate::config::{ConfigHandle, mcp::McpConfigHandle};
use crate::conn::{Conn, WsConn};
use crate::error::Result;
use crate::session::Session;
use crate::tts::{CosyVoice, Sambert, TtsProvider};
use axum::Router;
use axum::extract::{State, WebSocketUpgrade, ws::WebSocket};
use axum::response::IntoResponse;
use axum::routing::get;
use crow::agent::AgentProvider;
use crow::{OpenAiClient, ReActAgent, ToolRegistry};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state handed to every connection.
#[derive(Clone, Debug)]
pub struct AppState {
    /// System configuration.
    pub cfg: ConfigHandle,
    /// MCP server configuration.
    pub mcp_cfg: McpConfigHandle,
}

/// Build the router serving the voice-assistant endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/crow/v1", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn: Arc<dyn Conn> = Arc::new(WsConn::new(socket));
    let config = state.cfg.snapshot();

    let asr: Option<Arc<dyn AsrProvider>> =
        match config.selected_module.get("asr").map(String::as_str) {
            Some("paraformer") => Some(Arc::new(Paraformer::new())),
            _ => None,
        };
    let tts: Option<Arc<dyn TtsProvider>> =
        match config.selected_module.get("tts").map(String::as_str) {
            Some("cosy_voice") => Some(Arc::new(CosyVoice::new())),
            Some("sambert") => Some(Arc::new(Sambert::new())),
            _ => None,
        };

    let session = Session::new(state.cfg.clone(), conn, asr.clone(), tts.clone());
    info!(session_id = %session.session_id(), "client connected");

    if let Some(asr) = &asr {
        asr.set_listener(session.clone());
    }
    if let Some(tts) = &tts {
        tts.set_listener(session.clone());
    }

    let cfg = state.cfg.clone();
    let mcp_cfg = state.mcp_cfg.clone();
    session.handle(move || build_agent(cfg, mcp_cfg)).await;
}

/// Build the per-session agent: LLM from the selected module, tool registry
/// with built-ins plus every configured MCP server.
pub async fn build_agent(
    cfg: ConfigHandle,
    mcp_cfg: McpConfigHandle,
) -> Result<Arc<dyn AgentProvider>> {
    let config = cfg.snapshot();
    let llm_cfg = config.selected_llm().cloned().unwrap_or_default();
    let llm = Arc::new(OpenAiClient::new(
        llm_cfg.model,
        llm_cfg.api_key,
        llm_cfg.base_url,
    ));

    let registry = Arc::new(ToolRegistry::new());
    // A broken MCP server should not take the whole session down; the
    // built-in tools still work.
    if let Err(e) = registry.connect_servers(&mcp_cfg.snapshot()).await {
        warn!(error = %e, "failed to connect mcp servers, continuing with built-ins");
    }

    let system_prompt = crow::prompt::system_prompt(&registry.definitions());
    let agent = ReActAgent::builder()
        .name("crow")
        .llm(llm)
        .registry(registry)
        .system_prompt(system_prompt)
        .next_step_prompt(crow::prompt::NEXT_STEP_PROMPT)
        .max_observe(500)
        .memory_max(20)
        .build();
    Ok(Arc::new(agent))
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState) -> Result<()> {
    let config = state.cfg.snapshot();
    let addr = format!("{}:{}", config.server.ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "crow server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
