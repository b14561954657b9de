//! Tunables for every governed resource.
//!
//! All fields carry defaults sized for a small, memory-constrained host so a
//! deployment can start from an empty configuration and override knobs one
//! at a time.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Aggregate settings handed to [`crate::Governor::new`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    /// Workspace store.
    pub workspace: WorkspaceSettings,
    /// Connection pool.
    pub pool: PoolSettings,
    /// Job registry.
    pub jobs: JobSettings,
    /// dbt invocation.
    pub dbt: DbtSettings,
    /// Rate limiter.
    pub rate_limits: RateLimitSettings,
}

/// Where workspaces live and how long they survive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Directory holding `<tenant>/<content_set>` workspaces.
    pub root: PathBuf,
    /// Read-only project template copied into every new workspace.
    pub template_dir: PathBuf,
    /// Directory (relative to a workspace) that holds editable model files.
    pub model_dir: PathBuf,
    /// Workspaces untouched for longer than this are deleted.
    pub max_age_secs: u64,
    /// Cadence of the background reclamation pass.
    pub reclaim_interval_secs: u64,
    /// Generated profile configuration.
    pub profile: ProfileSettings,
}

impl WorkspaceSettings {
    /// [`Self::max_age_secs`] as a `Duration`.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// [`Self::reclaim_interval_secs`] as a `Duration`.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("quarry_workspaces"),
            template_dir: PathBuf::from("dbt_project"),
            model_dir: PathBuf::from("models"),
            max_age_secs: 24 * 60 * 60,
            reclaim_interval_secs: 60 * 60,
            profile: ProfileSettings::default(),
        }
    }
}

/// Shape of the generated `profiles.yml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// File written into every workspace.
    pub file_name: String,
    /// Top-level profile key.
    pub profile_name: String,
    /// Output target selected by the profile.
    pub target: String,
    /// dbt adapter (`type:` key).
    pub adapter: String,
    /// Database path / DSN handed to the adapter.
    pub database: String,
    /// Prefix of the per-tenant schema.
    pub schema_prefix: String,
    /// dbt worker threads.
    pub threads: u16,
    /// Environment variable the profile reads the database token from.
    /// The token itself never lands on disk.
    pub token_env_var: String,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            file_name: "profiles.yml".to_string(),
            profile_name: "quarry".to_string(),
            target: "dev".to_string(),
            adapter: "duckdb".to_string(),
            database: "md:".to_string(),
            schema_prefix: "learner_".to_string(),
            threads: 4,
            token_env_var: "MOTHERDUCK_TOKEN".to_string(),
        }
    }
}

/// Connection pool limits and timeouts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Hard ceiling on live connections (idle + in use).
    pub max_connections: usize,
    /// How long `acquire` waits for a free slot before `PoolExhausted`.
    pub acquire_timeout_ms: u64,
    /// Timeout for opening a connection.
    pub connect_timeout_secs: u64,
    /// Per-use timeout; a handle that overruns it is discarded.
    pub query_timeout_secs: u64,
    /// Idle handles older than this are closed by the reaper.
    pub idle_timeout_secs: u64,
    /// Cadence of the idle reaper.
    pub reap_interval_secs: u64,
    /// Rows beyond this are dropped from a query result.
    pub max_result_rows: usize,
}

impl PoolSettings {
    /// [`Self::acquire_timeout_ms`] as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// [`Self::connect_timeout_secs`] as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// [`Self::query_timeout_secs`] as a `Duration`.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// [`Self::idle_timeout_secs`] as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// [`Self::reap_interval_secs`] as a `Duration`.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout_ms: 10_000,
            connect_timeout_secs: 10,
            query_timeout_secs: 30,
            idle_timeout_secs: 300,
            reap_interval_secs: 60,
            max_result_rows: 10_000,
        }
    }
}

/// Job admission and supervision.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Ceiling on pending + running external processes.
    pub max_concurrent_jobs: usize,
    /// Running jobs older than this are force-terminated.
    pub job_max_age_secs: u64,
    /// Finished jobs are forgotten this long after they exit.
    pub job_retention_secs: u64,
    /// Time between SIGTERM and SIGKILL when terminating a job.
    pub kill_grace_ms: u64,
    /// Cadence of the background sweep of finished and runaway jobs.
    pub sweep_interval_secs: u64,
    /// Retained output per job; oldest chunks are dropped beyond it.
    pub output_buffer_bytes: usize,
}

impl JobSettings {
    /// [`Self::job_max_age_secs`] as a `Duration`.
    pub fn job_max_age(&self) -> Duration {
        Duration::from_secs(self.job_max_age_secs)
    }

    /// [`Self::job_retention_secs`] as a `Duration`.
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// [`Self::kill_grace_ms`] as a `Duration`.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// [`Self::sweep_interval_secs`] as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            job_max_age_secs: 5 * 60,
            job_retention_secs: 10 * 60,
            kill_grace_ms: 5_000,
            sweep_interval_secs: 30,
            output_buffer_bytes: 256 * 1024,
        }
    }
}

/// How the transformation CLI is invoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DbtSettings {
    /// Program name or path of the dbt CLI.
    pub executable: String,
    /// Database token exported to every job under
    /// [`ProfileSettings::token_env_var`].
    #[serde(skip_serializing)]
    pub database_token: Option<String>,
    /// Additional environment passed to every invocation.
    pub extra_env: Vec<(String, String)>,
}

impl Default for DbtSettings {
    fn default() -> Self {
        Self {
            executable: "dbt".to_string(),
            database_token: None,
            extra_env: Vec::new(),
        }
    }
}

/// A sliding-window ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    /// Requests allowed per window.
    pub limit: usize,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl WindowLimit {
    /// [`Self::window_secs`] as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-principal request limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// When false every request is let through.
    pub enabled: bool,
    /// Ceiling for ordinary requests.
    pub general: WindowLimit,
    /// Ceiling for runs, seeds, queries and log streams.
    pub expensive: WindowLimit,
    /// In-flight requests allowed per principal.
    pub max_concurrent_requests: usize,
    /// Request paths containing any of these markers count against the
    /// expensive bucket.
    pub expensive_path_markers: Vec<String>,
    /// Cadence of the window pruning pass.
    pub prune_interval_secs: u64,
}

impl RateLimitSettings {
    /// [`Self::prune_interval_secs`] as a `Duration`.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            general: WindowLimit {
                limit: 100,
                window_secs: 60,
            },
            expensive: WindowLimit {
                limit: 20,
                window_secs: 60,
            },
            max_concurrent_requests: 5,
            expensive_path_markers: vec![
                "/runs".to_string(),
                "/seeds".to_string(),
                "/query".to_string(),
                "/logs".to_string(),
            ],
            prune_interval_secs: 300,
        }
    }
}
