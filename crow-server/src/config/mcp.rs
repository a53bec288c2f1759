//! MCP server configuration: JSON file, hot-reloaded like the system config.

use crate::config::watch_file;
use crate::error::{Result, ServerError};
use crow::McpServersConfig;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{error, info};

fn load_mcp_config(path: &Path) -> Result<McpServersConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ServerError::config(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| ServerError::config(format!("parse {}: {e}", path.display())))
}

/// Shared handle to the current MCP server configuration.
#[derive(Clone)]
pub struct McpConfigHandle {
    inner: Arc<RwLock<Arc<McpServersConfig>>>,
    path: PathBuf,
}

impl std::fmt::Debug for McpConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConfigHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl McpConfigHandle {
    /// Load the configuration from `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_mcp_config(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path,
        })
    }

    /// A handle around a fixed configuration; used by tests and when no MCP
    /// config file exists.
    #[must_use]
    pub fn fixed(config: McpServersConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path: PathBuf::new(),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<McpServersConfig> {
        self.inner.read().expect("mcp config lock poisoned").clone()
    }

    /// Re-read the file and swap the snapshot.
    pub fn reload(&self) {
        match load_mcp_config(&self.path) {
            Ok(config) => {
                *self.inner.write().expect("mcp config lock poisoned") = Arc::new(config);
                info!(path = %self.path.display(), "mcp config reloaded");
            }
            Err(e) => error!(error = %e, "mcp config reload failed, keeping previous snapshot"),
        }
    }

    /// Watch the file and reload on change.
    pub fn watch(&self) {
        let handle = self.clone();
        watch_file(self.path.clone(), move || handle.reload());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_reload() {
        let dir = std::env::temp_dir().join(format!("crow-mcp-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mcp_server_setting.json");
        std::fs::write(
            &path,
            r#"{"mcpServers": {"files": {"type": "stdio", "command": "uvx", "args": ["mcp-server-files"]}}}"#,
        )
        .unwrap();

        let handle = McpConfigHandle::load(&path).unwrap();
        assert_eq!(handle.snapshot().mcp_servers.len(), 1);

        std::fs::write(&path, r#"{"mcpServers": {}}"#).unwrap();
        handle.reload();
        assert!(handle.snapshot().mcp_servers.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
