//! System configuration: YAML file, hot-reloaded with a debounce.
//!
//! The in-memory snapshot is an `Arc<Config>` behind a lock; readers take a
//! cheap clone and never observe a half-applied reload.

pub mod mcp;

use crate::error::{Result, ServerError};
use notify::Watcher;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Debounce window for file-change events.
pub(crate) const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Listen address and mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// "debug" or "release"; controls log verbosity defaults.
    pub mode: String,
    /// Bind IP.
    pub ip: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: "release".to_string(),
            ip: "0.0.0.0".to_string(),
            port: 28080,
        }
    }
}

/// Per-backend ASR credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AsrModuleConfig {
    /// Backend API key.
    #[serde(default)]
    pub api_key: String,
}

/// Per-backend LLM settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmModuleConfig {
    /// Model id.
    #[serde(default)]
    pub model: String,
    /// API key.
    #[serde(default)]
    pub api_key: String,
    /// Base URL for OpenAI-compatible gateways.
    #[serde(default)]
    pub base_url: String,
}

/// Per-backend TTS credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TtsModuleConfig {
    /// Backend API key.
    #[serde(default)]
    pub api_key: String,
}

/// The system configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server listen settings.
    pub server: ServerConfig,
    /// Which provider serves each module: keys "asr", "llm", "tts".
    pub selected_module: HashMap<String, String>,
    /// ASR backends by name.
    pub asr: HashMap<String, AsrModuleConfig>,
    /// LLM backends by name.
    pub llm: HashMap<String, LlmModuleConfig>,
    /// TTS backends by name.
    pub tts: HashMap<String, TtsModuleConfig>,
    /// Phrases that end the session after the current reply, compared after
    /// punctuation removal.
    pub cmd_exit: Vec<String>,
}

impl Config {
    /// The LLM settings for the selected module, if configured.
    #[must_use]
    pub fn selected_llm(&self) -> Option<&LlmModuleConfig> {
        self.selected_module
            .get("llm")
            .and_then(|name| self.llm.get(name))
    }

    /// The API key of the selected ASR backend.
    #[must_use]
    pub fn selected_asr_key(&self) -> String {
        self.selected_module
            .get("asr")
            .and_then(|name| self.asr.get(name))
            .map(|c| c.api_key.clone())
            .unwrap_or_default()
    }

    /// The API key of the selected TTS backend.
    #[must_use]
    pub fn selected_tts_key(&self) -> String {
        self.selected_module
            .get("tts")
            .and_then(|name| self.tts.get(name))
            .map(|c| c.api_key.clone())
            .unwrap_or_default()
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ServerError::config(format!("read {}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| ServerError::config(format!("parse {}: {e}", path.display())))
}

/// Shared handle to the current configuration snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
    path: PathBuf,
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConfigHandle {
    /// Load the configuration from `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path,
        })
    }

    /// A handle around a fixed configuration; used by tests.
    #[must_use]
    pub fn fixed(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path: PathBuf::new(),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Re-read the file and swap the snapshot. The old snapshot stays in
    /// place when the reload fails.
    pub fn reload(&self) {
        match load_config(&self.path) {
            Ok(config) => {
                *self.inner.write().expect("config lock poisoned") = Arc::new(config);
                info!(path = %self.path.display(), "config reloaded");
            }
            Err(e) => error!(error = %e, "config reload failed, keeping previous snapshot"),
        }
    }

    /// Watch the file and reload on change.
    pub fn watch(&self) {
        let handle = self.clone();
        let path = self.path.clone();
        watch_file(path, move || handle.reload());
    }
}

/// Watch `path` and invoke `reload` after changes settle for
/// [`RELOAD_DEBOUNCE`].
pub(crate) fn watch_file<F>(path: PathBuf, reload: F)
where
    F: Fn() + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<()>(16);

    let watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(event)
                if event.kind.is_modify()
                    || event.kind.is_create()
                    || event.kind.is_remove() =>
            {
                // Dropped signals are fine, the debounce coalesces anyway.
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "file watch error"),
        }
    });

    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(error = %e, "failed to create file watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&path, notify::RecursiveMode::NonRecursive) {
        error!(path = %path.display(), error = %e, "failed to watch file");
        return;
    }
    info!(path = %path.display(), "watching for changes");

    tokio::spawn(async move {
        // Keep the watcher alive for the life of the task.
        let _watcher = watcher;
        loop {
            if rx.recv().await.is_none() {
                return;
            }
            // Swallow the burst, then reload once it quiets down.
            loop {
                match tokio::time::timeout(RELOAD_DEBOUNCE, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            reload();
        }
    });
}
