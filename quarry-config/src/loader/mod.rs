//! Layered loading: config file, then `.env`, then the environment.

pub mod error;

use std::{fs, path::PathBuf};

use once_cell::sync::Lazy;
use quarry_core::GovernorSettings;
use url::Url;

pub use error::ConfigLoadError;

use crate::{
    models::{
        Config, ConfigMetadata, DatabaseConfig, SecurityConfig, ServerConfig,
        sources::{EnvConfig, FileConfig, FileDatabaseConfig},
    },
    validation::{self, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("quarry.toml"),
        PathBuf::from("config/quarry.toml"),
    ]
});

/// Inputs to [`ConfigLoader`].
#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    /// Explicit config file; it must exist.
    pub config_path: Option<PathBuf>,
    /// `.env` file to load instead of the default one.
    pub env_file: Option<PathBuf>,
    /// Replaces the process environment. No `.env` file is read when set.
    pub env: Option<EnvConfig>,
}

/// Resolves a [`Config`] from file, `.env` and environment.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

/// A loaded configuration and the warnings raised on the way.
#[derive(Debug)]
pub struct ConfigLoad {
    /// Resolved configuration.
    pub config: Config,
    /// Warnings for the operator.
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    /// Loader with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader with explicit options.
    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    /// Read this config file instead of searching for one.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Load this `.env` file.
    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Use a prepared environment instead of the process environment.
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.options.env = Some(env);
        self
    }

    /// Load, merge and validate the configuration.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env_config, env_file_loaded) = match &self.options.env {
            Some(env) => (env.clone(), false),
            None => {
                let loaded = self.load_env_file()?;
                (EnvConfig::gather(), loaded)
            }
        };

        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let (config, warnings) = self.compose_config(
            file_config,
            env_config,
            config_path,
            env_file_loaded,
        )?;

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match result {
            Ok(()) => Ok(true),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env_config.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(found) => found.clone(),
                None => return Ok((None, None)),
            },
        };

        let contents =
            fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
                path: path.clone(),
                source: err,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if config_path.is_none() {
            warnings.push_with_hint(
                "No quarry.toml detected; using defaults and environment variables",
                "Pass --config or set QUARRY_CONFIG to use a configuration file",
            );
        }
        for rejected in &env.rejected {
            warnings.push(format!(
                "Ignoring {}={:?}: not a valid value",
                rejected.name, rejected.value
            ));
        }

        let FileConfig {
            server: file_server,
            database: file_database,
            security: file_security,
            mut governor,
        } = file_config.unwrap_or_default();

        let server = ServerConfig {
            host: env
                .server_host
                .clone()
                .or(file_server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.server_port.or(file_server.port).unwrap_or(3000),
        };

        let database = DatabaseConfig {
            url: resolve_database_url(&env, &file_database)?,
        };

        let security = SecurityConfig {
            trust_proxy_headers: env
                .trust_proxy_headers
                .or(file_security.trust_proxy_headers)
                .unwrap_or(false),
        };

        apply_env_overrides(&mut governor, &env);

        let mut config = Config {
            server,
            database,
            security,
            governor,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        config
            .ensure_directories()
            .map_err(|err| ConfigLoadError::Filesystem { source: err })?;
        config
            .normalize_paths()
            .map_err(|err| ConfigLoadError::Filesystem { source: err })?;

        let guard_warnings = validation::apply_guard_rails(&config)?;
        warnings.extend(guard_warnings);

        Ok((config, warnings))
    }
}

fn resolve_database_url(
    env: &EnvConfig,
    file_database: &FileDatabaseConfig,
) -> Result<Option<String>, ConfigLoadError> {
    let raw = env
        .database_url
        .clone()
        .or_else(|| file_database.url.clone())
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());

    match raw {
        Some(url) => {
            Url::parse(&url)
                .map_err(|source| ConfigLoadError::InvalidDatabaseUrl { source })?;
            Ok(Some(url))
        }
        None => Ok(None),
    }
}

fn apply_env_overrides(governor: &mut GovernorSettings, env: &EnvConfig) {
    let workspace = &mut governor.workspace;
    if let Some(root) = &env.workspace_root {
        workspace.root = root.clone();
    }
    if let Some(template) = &env.template_dir {
        workspace.template_dir = template.clone();
    }
    if let Some(age) = env.workspace_max_age {
        workspace.max_age_secs = age.as_secs();
    }

    let pool = &mut governor.pool;
    if let Some(max) = env.max_connections {
        pool.max_connections = max;
    }
    if let Some(timeout) = env.acquire_timeout {
        pool.acquire_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    }
    if let Some(timeout) = env.query_timeout {
        pool.query_timeout_secs = timeout.as_secs();
    }
    if let Some(timeout) = env.idle_timeout {
        pool.idle_timeout_secs = timeout.as_secs();
    }
    if let Some(rows) = env.max_result_rows {
        pool.max_result_rows = rows;
    }

    let jobs = &mut governor.jobs;
    if let Some(max) = env.max_concurrent_jobs {
        jobs.max_concurrent_jobs = max;
    }
    if let Some(age) = env.job_max_age {
        jobs.job_max_age_secs = age.as_secs();
    }
    if let Some(retention) = env.job_retention {
        jobs.job_retention_secs = retention.as_secs();
    }

    if let Some(executable) = &env.dbt_executable {
        governor.dbt.executable = executable.clone();
    }
    if let Some(token) = &env.database_token {
        governor.dbt.database_token = Some(token.clone());
    }

    let limits = &mut governor.rate_limits;
    if let Some(enabled) = env.rate_limit_enabled {
        limits.enabled = enabled;
    }
    if let Some(limit) = env.rate_limit_general {
        limits.general.limit = limit;
    }
    if let Some(limit) = env.rate_limit_expensive {
        limits.expensive.limit = limit;
    }
    if let Some(window) = env.rate_limit_window {
        limits.general.window_secs = window.as_secs();
        limits.expensive.window_secs = window.as_secs();
    }
    if let Some(max) = env.max_concurrent_requests {
        limits.max_concurrent_requests = max;
    }
    if let Some(markers) = &env.expensive_path_markers {
        limits.expensive_path_markers = markers.clone();
    }
}
