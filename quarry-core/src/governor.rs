//! Composition root tying the four governed resources together.
//!
//! The governor owns one instance of each component and only sequences calls
//! between them; no component calls into another.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ids::{ContentSetId, ModelName, TenantId};
use crate::jobs::{DbtInvocation, JobId, JobRegistry, JobSnapshot, JobStats, OutputEvent};
use crate::pool::{ConnectionPool, Connector, PgConnector, PoolStats, QueryResult};
use crate::ratelimit::{PruneReport, RateLimitStats, RateLimiter};
use crate::settings::GovernorSettings;
use crate::workspace::{ModelFile, ReclaimReport, WorkspaceStats, WorkspaceStore};

/// Occupancy of every governed resource.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStats {
    /// Workspace store.
    pub workspaces: WorkspaceStats,
    /// Connection pool.
    pub pool: PoolStats,
    /// Job registry.
    pub jobs: JobStats,
    /// Rate limiter.
    pub rate_limits: RateLimitStats,
}

/// What one [`Governor::maintenance_pass`] freed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    /// Workspace reclamation.
    pub workspaces: ReclaimReport,
    /// Finished jobs past retention that were forgotten.
    pub jobs_swept: usize,
    /// Runaway jobs asked to terminate.
    pub jobs_reaped: usize,
    /// Idle connections closed.
    pub connections_reaped: usize,
    /// Rate-limit window pruning.
    pub rate_limits: PruneReport,
}

/// Owns the workspace store, job registry, connection pool and rate
/// limiter, and sequences calls between them.
pub struct Governor<C: Connector = PgConnector> {
    settings: GovernorSettings,
    workspaces: Arc<WorkspaceStore>,
    jobs: Arc<JobRegistry>,
    pool: ConnectionPool<C>,
    limiter: Arc<RateLimiter>,
}

impl<C: Connector> std::fmt::Debug for Governor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("workspaces", &self.workspaces)
            .field("jobs", &self.jobs)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Governor<C> {
    /// Build every component from `settings`.
    pub fn new(settings: GovernorSettings, connector: C) -> Self {
        let workspaces = Arc::new(WorkspaceStore::with_default_renderer(
            settings.workspace.clone(),
        ));
        let jobs = Arc::new(JobRegistry::new(settings.jobs.clone()));
        let pool = ConnectionPool::new(connector, settings.pool.clone());
        let limiter = Arc::new(RateLimiter::new(settings.rate_limits.clone()));

        Self::from_parts(settings, workspaces, jobs, pool, limiter)
    }

    /// Assemble a governor from components built elsewhere.
    pub fn from_parts(
        settings: GovernorSettings,
        workspaces: Arc<WorkspaceStore>,
        jobs: Arc<JobRegistry>,
        pool: ConnectionPool<C>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            settings,
            workspaces,
            jobs,
            pool,
            limiter,
        }
    }

    /// Settings the governor was built with.
    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    /// Workspace store.
    pub fn workspaces(&self) -> &Arc<WorkspaceStore> {
        &self.workspaces
    }

    /// Job registry.
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Connection pool.
    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Request rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Ensure the workspace exists and the tenant's database namespace is
    /// in place. A namespace failure is logged but does not fail the call.
    pub async fn initialize_workspace(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> Result<PathBuf> {
        let path = self.workspaces.acquire(tenant, content_set).await?;

        let namespace = self.namespace(tenant);
        let outcome = self
            .pool
            .with_connection(move |connector, conn| {
                Box::pin(async move { connector.ensure_namespace(conn, &namespace).await })
            })
            .await;
        if let Err(e) = outcome {
            warn!(tenant = %tenant, error = %e, "failed to ensure tenant namespace");
        }

        Ok(path)
    }

    /// Admit a dbt invocation in the tenant's workspace, creating the
    /// workspace first when needed.
    pub async fn start_dbt(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
        invocation: DbtInvocation,
    ) -> Result<JobId> {
        let workspace = self.workspaces.acquire(tenant, content_set).await?;
        let command = invocation.into_command(
            &self.settings.dbt,
            &self.settings.workspace.profile,
            &workspace,
        );
        self.jobs.submit(tenant, &workspace, command)
    }

    /// Start `dbt run`. An empty `models` list runs the whole project.
    pub async fn start_run(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
        models: Vec<ModelName>,
        include_children: bool,
        full_refresh: bool,
    ) -> Result<JobId> {
        let invocation = DbtInvocation::run(models, include_children, full_refresh);
        self.start_dbt(tenant, content_set, invocation).await
    }

    /// Start `dbt seed`.
    pub async fn start_seed(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> Result<JobId> {
        self.start_dbt(tenant, content_set, DbtInvocation::seed()).await
    }

    /// Run ad-hoc SQL in the tenant's namespace through the pool.
    pub async fn run_query(&self, tenant: &TenantId, sql: &str) -> Result<QueryResult> {
        let namespace = self.namespace(tenant);
        let sql = sql.to_string();
        let max_rows = self.settings.pool.max_result_rows;

        self.pool
            .with_connection(move |connector, conn| {
                Box::pin(async move { connector.execute(conn, &namespace, &sql, max_rows).await })
            })
            .await
    }

    /// Snapshot of one of the tenant's jobs.
    pub fn job_status(&self, tenant: &TenantId, id: JobId) -> Result<JobSnapshot> {
        self.jobs.status(tenant, id)
    }

    /// Every retained job of the tenant, oldest first.
    pub fn list_jobs(&self, tenant: &TenantId) -> Vec<JobSnapshot> {
        self.jobs.list(tenant)
    }

    /// Follow a job's output until it exits.
    pub fn attach_output(
        &self,
        tenant: &TenantId,
        id: JobId,
    ) -> Result<impl Stream<Item = OutputEvent> + Send + use<C>> {
        self.jobs.attach(tenant, id)
    }

    /// Request termination of one of the tenant's jobs.
    pub fn cancel_job(&self, tenant: &TenantId, id: JobId) -> Result<JobSnapshot> {
        self.jobs.cancel(tenant, id)
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait_job(&self, tenant: &TenantId, id: JobId) -> Result<JobSnapshot> {
        self.jobs.wait(tenant, id).await
    }

    /// Model files of an existing workspace.
    pub async fn list_models(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> Result<Vec<ModelFile>> {
        self.workspaces.list_models(tenant, content_set).await
    }

    /// Contents of a model file, `None` when absent.
    pub async fn read_model(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
        model: &ModelName,
    ) -> Result<Option<String>> {
        self.workspaces.read_model(tenant, content_set, model).await
    }

    /// Create or replace a model file.
    pub async fn write_model(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
        model: &ModelName,
        contents: &str,
    ) -> Result<()> {
        self.workspaces
            .write_model(tenant, content_set, model, contents)
            .await
    }

    /// Occupancy of all four components.
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            workspaces: self.workspaces.stats(),
            pool: self.pool.stats(),
            jobs: self.jobs.stats(),
            rate_limits: self.limiter.stats(),
        }
    }

    /// Run every reclamation step once.
    pub async fn maintenance_pass(&self) -> Result<MaintenanceReport> {
        let now = Instant::now();
        let report = MaintenanceReport {
            jobs_swept: self.jobs.sweep_finished(now),
            jobs_reaped: self.jobs.reap_runaway(now),
            connections_reaped: self.pool.reap_idle(now),
            rate_limits: self.limiter.prune(now),
            workspaces: self.workspaces.reclaim_expired(Utc::now()).await?,
        };
        debug!(?report, "maintenance pass completed");
        Ok(report)
    }

    /// Start the background reclamation loops. They stop when `shutdown` is
    /// cancelled.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workspaces = Arc::clone(&self.workspaces);
        let jobs = Arc::clone(&self.jobs);
        let sweeper = Arc::clone(&self.jobs);
        let pool = self.pool.clone();
        let limiter = Arc::clone(&self.limiter);

        info!(
            reclaim_interval = ?self.settings.workspace.reclaim_interval(),
            sweep_interval = ?self.settings.jobs.sweep_interval(),
            reap_interval = ?self.settings.pool.reap_interval(),
            prune_interval = ?self.settings.rate_limits.prune_interval(),
            "starting maintenance loops"
        );

        vec![
            every(
                "workspace reclamation",
                self.settings.workspace.reclaim_interval(),
                shutdown.clone(),
                move || {
                    let workspaces = Arc::clone(&workspaces);
                    async move {
                        if let Err(e) = workspaces.reclaim_expired(Utc::now()).await {
                            warn!(error = %e, "workspace reclamation failed");
                        }
                    }
                },
            ),
            every(
                "job sweep",
                self.settings.jobs.sweep_interval(),
                shutdown.clone(),
                move || {
                    let now = Instant::now();
                    sweeper.sweep_finished(now);
                    sweeper.reap_runaway(now);
                    async {}
                },
            ),
            every(
                "idle connection reaping",
                self.settings.pool.reap_interval(),
                shutdown.clone(),
                move || {
                    pool.reap_idle(Instant::now());
                    async {}
                },
            ),
            every(
                "rate limit pruning",
                self.settings.rate_limits.prune_interval(),
                shutdown.clone(),
                move || {
                    limiter.prune(Instant::now());
                    async {}
                },
            ),
            tokio::spawn(async move {
                shutdown.cancelled().await;
                let cancelled = jobs.cancel_all();
                if cancelled > 0 {
                    info!(cancelled, "terminating running jobs for shutdown");
                }
            }),
        ]
    }

    fn namespace(&self, tenant: &TenantId) -> String {
        tenant.namespace(&self.settings.workspace.profile.schema_prefix)
    }
}

fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(task = name, "maintenance loop stopped");
                    break;
                }
                _ = interval.tick() => task().await,
            }
        }
    })
}
