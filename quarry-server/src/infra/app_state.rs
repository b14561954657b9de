use std::{fmt, sync::Arc};

use anyhow::Context;
use quarry_config::Config;
use quarry_core::{Governor, pool::PgConnector};

#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<Governor>,
    pub config: Arc<Config>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(config: Config, governor: Governor) -> Self {
        Self {
            governor: Arc::new(governor),
            config: Arc::new(config),
        }
    }

    /// Builds the governor against the configured database.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let connector = match config.database.url.as_deref() {
            Some(url) => {
                PgConnector::new(url).context("invalid database URL")?
            }
            None => PgConnector::from_env(),
        };
        let governor = Governor::new(config.governor.clone(), connector);
        Ok(Self::new(config, governor))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
