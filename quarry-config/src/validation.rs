//! Guard rails applied to a composed [`Config`].
//!
//! Settings the governor cannot run with are hard errors. Settings that work
//! but are likely mistakes become [`ConfigWarnings`] for the caller to log.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::Config;

/// A questionable but usable setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// What looks wrong.
    pub message: String,
    /// How to fix it.
    pub hint: Option<String>,
}

/// Warnings collected while loading.
#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    /// Warnings in the order they were raised.
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    /// Add a warning without a hint.
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    /// Add a warning with a remediation hint.
    pub fn push_with_hint(
        &mut self,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    /// Append every warning from `other`.
    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    /// No warnings were raised.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of warnings.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Warnings in order.
    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Settings the governor cannot run with.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    /// A ceiling or timeout is zero.
    #[error("{setting} must be greater than zero")]
    ZeroLimit {
        /// Dotted setting name.
        setting: &'static str,
    },
    /// The workspace template cannot be found.
    #[error("workspace template directory {path} does not exist")]
    MissingTemplate {
        /// Configured template path.
        path: PathBuf,
    },
}

/// Reject impossible settings and collect warnings for questionable ones.
pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let governor = &config.governor;
    let mut warnings = ConfigWarnings::default();

    let mut ceilings = vec![
        ("pool.max_connections", governor.pool.max_connections as u64),
        ("pool.query_timeout_secs", governor.pool.query_timeout_secs),
        ("jobs.max_concurrent_jobs", governor.jobs.max_concurrent_jobs as u64),
        ("jobs.job_max_age_secs", governor.jobs.job_max_age_secs),
        (
            "jobs.output_buffer_bytes",
            governor.jobs.output_buffer_bytes as u64,
        ),
        ("workspace.max_age_secs", governor.workspace.max_age_secs),
    ];
    let limits = &governor.rate_limits;
    if limits.enabled {
        ceilings.extend([
            ("rate_limits.general.limit", limits.general.limit as u64),
            ("rate_limits.general.window_secs", limits.general.window_secs),
            ("rate_limits.expensive.limit", limits.expensive.limit as u64),
            (
                "rate_limits.expensive.window_secs",
                limits.expensive.window_secs,
            ),
            (
                "rate_limits.max_concurrent_requests",
                limits.max_concurrent_requests as u64,
            ),
        ]);
    } else {
        warnings.push_with_hint(
            "Rate limiting is disabled",
            "Set rate_limits.enabled = true before exposing the server",
        );
    }
    if let Some(&(setting, _)) = ceilings.iter().find(|(_, value)| *value == 0)
    {
        return Err(ConfigGuardRailError::ZeroLimit { setting });
    }

    let template = &governor.workspace.template_dir;
    if !template.is_dir() {
        return Err(ConfigGuardRailError::MissingTemplate {
            path: template.clone(),
        });
    }

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "No database URL configured; falling back to the PG* environment variables",
            "Set DATABASE_URL or [database].url",
        );
    }

    if governor.dbt.database_token.is_none() {
        warnings.push_with_hint(
            format!(
                "No database token configured; jobs only see {} if the server environment provides it",
                governor.workspace.profile.token_env_var
            ),
            "Set QUARRY_DATABASE_TOKEN",
        );
    }

    if governor.jobs.job_max_age() <= governor.jobs.kill_grace() {
        warnings.push(format!(
            "jobs.job_max_age_secs ({}s) does not exceed the kill grace period ({}ms)",
            governor.jobs.job_max_age_secs, governor.jobs.kill_grace_ms
        ));
    }

    if governor.workspace.max_age() < governor.jobs.job_max_age() {
        warnings.push_with_hint(
            "Workspaces can expire while a job is still allowed to run in them",
            "Keep workspace.max_age_secs above jobs.job_max_age_secs",
        );
    }

    if limits.enabled && limits.expensive.limit > limits.general.limit {
        warnings.push(
            "The expensive request budget is larger than the general one",
        );
    }

    Ok(warnings)
}
