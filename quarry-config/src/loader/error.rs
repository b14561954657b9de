//! Failures surfaced by [`super::ConfigLoader::load`].

use std::path::PathBuf;

use thiserror::Error;

use crate::validation::ConfigGuardRailError;

/// Reasons configuration loading fails.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// An explicitly requested config file does not exist.
    #[error("configuration file missing: {path}")]
    MissingConfig {
        /// Requested path.
        path: PathBuf,
    },
    /// The config file could not be read.
    #[error("failed to read configuration {path}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for [`crate::FileConfig`].
    #[error("failed to parse configuration {path}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// Parser error with location.
        #[source]
        source: toml::de::Error,
    },
    /// The database URL does not parse.
    #[error("invalid database URL")]
    InvalidDatabaseUrl {
        /// Parser error.
        #[source]
        source: url::ParseError,
    },
    /// Creating or resolving configured directories failed.
    #[error("filesystem initialization failed")]
    Filesystem {
        /// Underlying failure with context.
        source: anyhow::Error,
    },
    /// An impossible setting.
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    /// The `.env` file could not be loaded.
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
