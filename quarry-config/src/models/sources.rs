//! Raw inputs before merging: the TOML file and the process environment.

use std::{path::PathBuf, str::FromStr, time::Duration};

use quarry_core::GovernorSettings;
use serde::{Deserialize, Serialize};

use crate::util::{parse_bool, parse_csv, parse_duration};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    /// `[server]` table.
    #[serde(default)]
    pub server: FileServerConfig,
    /// `[database]` table.
    #[serde(default)]
    pub database: FileDatabaseConfig,
    /// `[security]` table.
    #[serde(default)]
    pub security: FileSecurityConfig,
    /// Governor tunables; every table and key is optional.
    #[serde(default)]
    pub governor: GovernorSettings,
}

/// `[server]` table of the config file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    /// Bind host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Bind port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// `[database]` table of the config file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    /// PostgreSQL URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `[security]` table of the config file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSecurityConfig {
    /// Honour `X-Forwarded-For` / `X-Real-IP`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_proxy_headers: Option<bool>,
}

/// An environment variable that was set but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEnvVar {
    /// Variable name.
    pub name: &'static str,
    /// Raw value as found.
    pub value: String,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    /// `QUARRY_CONFIG`
    pub config_path: Option<PathBuf>,
    /// `SERVER_HOST`
    pub server_host: Option<String>,
    /// `SERVER_PORT`
    pub server_port: Option<u16>,
    /// `DATABASE_URL`
    pub database_url: Option<String>,
    /// `QUARRY_DATABASE_TOKEN`, exported to dbt jobs.
    pub database_token: Option<String>,
    /// `TRUST_PROXY_HEADERS`
    pub trust_proxy_headers: Option<bool>,
    /// `QUARRY_WORKSPACE_ROOT`
    pub workspace_root: Option<PathBuf>,
    /// `QUARRY_TEMPLATE_DIR`
    pub template_dir: Option<PathBuf>,
    /// `QUARRY_WORKSPACE_MAX_AGE`
    pub workspace_max_age: Option<Duration>,
    /// `QUARRY_MAX_CONNECTIONS`
    pub max_connections: Option<usize>,
    /// `QUARRY_ACQUIRE_TIMEOUT`
    pub acquire_timeout: Option<Duration>,
    /// `QUARRY_QUERY_TIMEOUT`
    pub query_timeout: Option<Duration>,
    /// `QUARRY_IDLE_TIMEOUT`
    pub idle_timeout: Option<Duration>,
    /// `QUARRY_MAX_RESULT_ROWS`
    pub max_result_rows: Option<usize>,
    /// `QUARRY_MAX_CONCURRENT_JOBS`
    pub max_concurrent_jobs: Option<usize>,
    /// `QUARRY_JOB_MAX_AGE`
    pub job_max_age: Option<Duration>,
    /// `QUARRY_JOB_RETENTION`
    pub job_retention: Option<Duration>,
    /// `QUARRY_DBT_EXECUTABLE`
    pub dbt_executable: Option<String>,
    /// `QUARRY_RATE_LIMIT_ENABLED`
    pub rate_limit_enabled: Option<bool>,
    /// `QUARRY_RATE_LIMIT_GENERAL`
    pub rate_limit_general: Option<usize>,
    /// `QUARRY_RATE_LIMIT_EXPENSIVE`
    pub rate_limit_expensive: Option<usize>,
    /// `QUARRY_RATE_LIMIT_WINDOW`, shared by both buckets.
    pub rate_limit_window: Option<Duration>,
    /// `QUARRY_MAX_CONCURRENT_REQUESTS`
    pub max_concurrent_requests: Option<usize>,
    /// `QUARRY_EXPENSIVE_PATHS`, comma separated.
    pub expensive_path_markers: Option<Vec<String>>,
    /// Variables that were set but did not parse.
    pub rejected: Vec<RejectedEnvVar>,
}

impl EnvConfig {
    /// Snapshot of the process environment.
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the environment layer from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = EnvReader {
            lookup,
            rejected: Vec::new(),
        };

        let mut env = Self {
            config_path: reader.string("QUARRY_CONFIG").map(PathBuf::from),
            server_host: reader.string("SERVER_HOST"),
            server_port: reader.parsed("SERVER_PORT"),
            database_url: reader.string("DATABASE_URL"),
            database_token: reader.string("QUARRY_DATABASE_TOKEN"),
            trust_proxy_headers: reader.flag("TRUST_PROXY_HEADERS"),
            ..Self::default()
        };

        env.workspace_root =
            reader.string("QUARRY_WORKSPACE_ROOT").map(PathBuf::from);
        env.template_dir =
            reader.string("QUARRY_TEMPLATE_DIR").map(PathBuf::from);
        env.workspace_max_age = reader.duration("QUARRY_WORKSPACE_MAX_AGE");

        env.max_connections = reader.parsed("QUARRY_MAX_CONNECTIONS");
        env.acquire_timeout = reader.duration("QUARRY_ACQUIRE_TIMEOUT");
        env.query_timeout = reader.duration("QUARRY_QUERY_TIMEOUT");
        env.idle_timeout = reader.duration("QUARRY_IDLE_TIMEOUT");
        env.max_result_rows = reader.parsed("QUARRY_MAX_RESULT_ROWS");

        env.max_concurrent_jobs = reader.parsed("QUARRY_MAX_CONCURRENT_JOBS");
        env.job_max_age = reader.duration("QUARRY_JOB_MAX_AGE");
        env.job_retention = reader.duration("QUARRY_JOB_RETENTION");
        env.dbt_executable = reader.string("QUARRY_DBT_EXECUTABLE");

        env.rate_limit_enabled = reader.flag("QUARRY_RATE_LIMIT_ENABLED");
        env.rate_limit_general = reader.parsed("QUARRY_RATE_LIMIT_GENERAL");
        env.rate_limit_expensive =
            reader.parsed("QUARRY_RATE_LIMIT_EXPENSIVE");
        env.rate_limit_window = reader.duration("QUARRY_RATE_LIMIT_WINDOW");
        env.max_concurrent_requests =
            reader.parsed("QUARRY_MAX_CONCURRENT_REQUESTS");
        env.expensive_path_markers = reader
            .string("QUARRY_EXPENSIVE_PATHS")
            .map(|raw| parse_csv(&raw));

        env.rejected = reader.rejected;
        env
    }
}

struct EnvReader<F> {
    lookup: F,
    rejected: Vec<RejectedEnvVar>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn parsed<T: FromStr>(&mut self, name: &'static str) -> Option<T> {
        let raw = self.string(name)?;
        let parsed: Result<T, _> = raw.trim().parse();
        match parsed {
            Ok(value) => Some(value),
            Err(_) => self.reject(name, raw),
        }
    }

    fn flag(&mut self, name: &'static str) -> Option<bool> {
        let raw = self.string(name)?;
        parse_bool(&raw).or_else(|| self.reject(name, raw))
    }

    fn duration(&mut self, name: &'static str) -> Option<Duration> {
        let raw = self.string(name)?;
        parse_duration(&raw).or_else(|| self.reject(name, raw))
    }

    fn reject<T>(&mut self, name: &'static str, value: String) -> Option<T> {
        self.rejected.push(RejectedEnvVar { name, value });
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn knobs_are_parsed() {
        let env = env(&[
            ("SERVER_PORT", "8080"),
            ("QUARRY_MAX_CONCURRENT_JOBS", "3"),
            ("QUARRY_JOB_MAX_AGE", "10m"),
            ("QUARRY_RATE_LIMIT_ENABLED", "off"),
            ("QUARRY_EXPENSIVE_PATHS", "/runs,/query"),
        ]);

        assert_eq!(env.server_port, Some(8080));
        assert_eq!(env.max_concurrent_jobs, Some(3));
        assert_eq!(env.job_max_age, Some(Duration::from_secs(600)));
        assert_eq!(env.rate_limit_enabled, Some(false));
        assert_eq!(
            env.expensive_path_markers.as_deref(),
            Some(&["/runs".to_string(), "/query".to_string()][..])
        );
        assert!(env.rejected.is_empty());
    }

    #[test]
    fn unparseable_values_are_recorded_not_applied() {
        let env = env(&[
            ("SERVER_PORT", "eighty"),
            ("QUARRY_QUERY_TIMEOUT", "whenever"),
            ("SERVER_HOST", "   "),
        ]);

        assert_eq!(env.server_port, None);
        assert_eq!(env.query_timeout, None);
        assert_eq!(env.server_host, None);
        let names: Vec<_> = env.rejected.iter().map(|r| r.name).collect();
        assert_eq!(names, ["SERVER_PORT", "QUARRY_QUERY_TIMEOUT"]);
    }
}
