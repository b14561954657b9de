//! Resolved configuration handed to the server.

pub mod sources;

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use quarry_core::GovernorSettings;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Database connection.
    pub database: DatabaseConfig,
    /// Request attribution.
    pub security: SecurityConfig,
    /// Governor limits and timeouts.
    pub governor: GovernorSettings,
    /// Where the values came from.
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Creates the workspace root so the first acquire does not race on it.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        let root = &self.governor.workspace.root;
        std::fs::create_dir_all(root).with_context(|| {
            format!("failed to create workspace root {}", root.display())
        })
    }

    /// Make the workspace root and template paths absolute.
    pub fn normalize_paths(&mut self) -> anyhow::Result<()> {
        let workspace = &mut self.governor.workspace;
        workspace.root =
            std::fs::canonicalize(&workspace.root).with_context(|| {
                format!(
                    "failed to resolve workspace root {}",
                    workspace.root.display()
                )
            })?;
        // A missing template is reported by the guard rails.
        if let Ok(template) = std::fs::canonicalize(&workspace.template_dir) {
            workspace.template_dir = template;
        }
        Ok(())
    }

    /// Socket address the server listens on.
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        let raw = format!("{}:{}", self.server.host, self.server.port);
        raw.parse()
            .with_context(|| format!("invalid bind address {raw}"))
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

/// Database connection settings.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Connection string of the shared analytical database.
    pub url: Option<String>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How callers are attributed.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Honour `X-Forwarded-For` when identifying anonymous callers.
    pub trust_proxy_headers: bool,
}

/// Provenance of a loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    /// Config file that was read, if any.
    pub config_path: Option<PathBuf>,
    /// Whether a `.env` file was applied.
    pub env_file_loaded: bool,
}
