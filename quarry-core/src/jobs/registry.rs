use std::{collections::HashMap, fmt, path::Path, process::ExitStatus, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::Child,
    sync::watch,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::JobCommand;
use super::job::{JobId, JobSnapshot, JobStatus, KillReason};
use super::output::{OutputEvent, OutputLog, OutputSource};
use super::process;
use crate::error::{GovernorError, Result};
use crate::ids::TenantId;
use crate::settings::JobSettings;

/// Output still buffered in the pipes after the process exits is drained for
/// at most this long.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest chunk taken from a pipe that produces no newline.
const MAX_CHUNK_BYTES: usize = 8 * 1024;

struct JobEntry {
    tenant: TenantId,
    label: String,
    status: JobStatus,
    exit_code: Option<i32>,
    kill_reason: Option<KillReason>,
    pid: Option<u32>,
    submitted_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    finished_at: Option<DateTime<Utc>>,
    output: Arc<OutputLog>,
    cancel: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
}

impl JobEntry {
    fn snapshot(&self, id: JobId) -> JobSnapshot {
        JobSnapshot {
            id,
            tenant: self.tenant.clone(),
            label: self.label.clone(),
            status: self.status,
            exit_code: self.exit_code,
            kill_reason: self.kill_reason,
            pid: self.pid,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }

    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.status_tx.send_replace(status);
    }
}

type JobTable = Arc<Mutex<HashMap<JobId, JobEntry>>>;

/// Job counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Admitted but not yet running.
    pub pending: usize,
    /// Running.
    pub running: usize,
    /// Terminal, still retained.
    pub finished: usize,
    /// Configured ceiling.
    pub max_concurrent_jobs: usize,
}

/// Tracks every external process and enforces the concurrent job ceiling.
///
/// Admission never queues: a submission that would exceed
/// `max_concurrent_jobs` is rejected immediately and leaves no trace in the
/// registry.
pub struct JobRegistry {
    settings: JobSettings,
    jobs: JobTable,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl JobRegistry {
    /// Empty registry.
    pub fn new(settings: JobSettings) -> Self {
        Self {
            settings,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Settings the registry enforces.
    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Admit and start `command` for `tenant`, running in `workspace` unless
    /// the command names its own directory.
    pub fn submit(
        &self,
        tenant: &TenantId,
        workspace: &Path,
        command: JobCommand,
    ) -> Result<JobId> {
        let now = Instant::now();
        self.sweep_finished(now);
        self.reap_runaway(now);

        let id = JobId::new();
        let limit = self.settings.max_concurrent_jobs;
        let output = Arc::new(OutputLog::new(self.settings.output_buffer_bytes));
        let cancel = CancellationToken::new();

        {
            let mut jobs = self.jobs.lock();
            let active = jobs.values().filter(|job| job.status.is_active()).count();
            if active >= limit {
                drop(jobs);
                warn!(
                    tenant = %tenant,
                    running = active,
                    limit,
                    label = %command.label,
                    "job admission rejected"
                );
                return Err(GovernorError::AdmissionRejected {
                    running: active,
                    limit,
                });
            }

            let (status_tx, _) = watch::channel(JobStatus::Pending);
            jobs.insert(
                id,
                JobEntry {
                    tenant: tenant.clone(),
                    label: command.label.clone(),
                    status: JobStatus::Pending,
                    exit_code: None,
                    kill_reason: None,
                    pid: None,
                    submitted_at: Utc::now(),
                    started: now,
                    finished: None,
                    finished_at: None,
                    output: Arc::clone(&output),
                    cancel: cancel.clone(),
                    status_tx,
                },
            );
        }

        let mut child = match process::spawn(&command, workspace) {
            Ok(child) => child,
            Err(source) => {
                self.jobs.lock().remove(&id);
                warn!(
                    tenant = %tenant,
                    program = %command.program,
                    error = %source,
                    "failed to spawn job"
                );
                return Err(GovernorError::JobSpawn {
                    program: command.program,
                    source,
                });
            }
        };

        let pid = child.id();
        let pumps = [
            child
                .stdout
                .take()
                .map(|out| pump(out, OutputSource::Stdout, Arc::clone(&output))),
            child
                .stderr
                .take()
                .map(|err| pump(err, OutputSource::Stderr, Arc::clone(&output))),
        ];

        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.pid = pid;
            job.set_status(JobStatus::Running);
        }

        info!(
            job = %id,
            tenant = %tenant,
            label = %command.label,
            pid,
            "job started"
        );

        tokio::spawn(supervise(
            Arc::clone(&self.jobs),
            id,
            child,
            pumps,
            output,
            cancel,
            self.settings.kill_grace(),
        ));

        Ok(id)
    }

    /// Snapshot of one of the tenant's jobs.
    pub fn status(&self, tenant: &TenantId, id: JobId) -> Result<JobSnapshot> {
        let jobs = self.jobs.lock();
        owned(&jobs, tenant, id).map(|job| job.snapshot(id))
    }

    /// Jobs of `tenant`, oldest first.
    pub fn list(&self, tenant: &TenantId) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock();
        let mut snapshots: Vec<JobSnapshot> = jobs
            .iter()
            .filter(|(_, job)| &job.tenant == tenant)
            .map(|(id, job)| job.snapshot(*id))
            .collect();
        snapshots.sort_by_key(|s| s.id.as_uuid());
        snapshots
    }

    /// Output stream of a job, from the oldest retained chunk until the job
    /// exits. Dropping the stream does not affect the job.
    pub fn attach(
        &self,
        tenant: &TenantId,
        id: JobId,
    ) -> Result<impl Stream<Item = OutputEvent> + Send + use<>> {
        let output = {
            let jobs = self.jobs.lock();
            Arc::clone(&owned(&jobs, tenant, id)?.output)
        };
        Ok(output.attach())
    }

    /// Request termination of an active job.
    pub fn cancel(&self, tenant: &TenantId, id: JobId) -> Result<JobSnapshot> {
        let mut jobs = self.jobs.lock();
        let job = owned_mut(&mut jobs, tenant, id)?;
        if job.status.is_active() && !job.cancel.is_cancelled() {
            job.kill_reason = Some(KillReason::Cancelled);
            job.cancel.cancel();
            info!(job = %id, tenant = %tenant, "job cancellation requested");
        }
        Ok(job.snapshot(id))
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait(&self, tenant: &TenantId, id: JobId) -> Result<JobSnapshot> {
        let mut rx = {
            let jobs = self.jobs.lock();
            owned(&jobs, tenant, id)?.status_tx.subscribe()
        };
        // An error means the entry was swept, which only happens to finished
        // jobs; the lookup below reports it.
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.status(tenant, id)
    }

    /// Forget terminal jobs that finished more than `job_retention` before
    /// `now`.
    pub fn sweep_finished(&self, now: Instant) -> usize {
        let retention = self.settings.job_retention();
        let removed = {
            let mut jobs = self.jobs.lock();
            let before = jobs.len();
            jobs.retain(|_, job| {
                !(job.status.is_terminal()
                    && job
                        .finished
                        .is_some_and(|at| now.saturating_duration_since(at) > retention))
            });
            before - jobs.len()
        };

        if removed > 0 {
            info!(removed, "swept finished jobs");
        }
        removed
    }

    /// Terminate active jobs started more than `job_max_age` before `now`.
    /// Returns how many terminations were requested by this call.
    pub fn reap_runaway(&self, now: Instant) -> usize {
        let max_age = self.settings.job_max_age();
        let mut reaped = 0;
        let mut jobs = self.jobs.lock();

        for (id, job) in jobs.iter_mut() {
            let age = now.saturating_duration_since(job.started);
            if job.status.is_active() && age > max_age && !job.cancel.is_cancelled() {
                job.kill_reason = Some(KillReason::MaxAge);
                job.cancel.cancel();
                reaped += 1;
                warn!(
                    job = %id,
                    tenant = %job.tenant,
                    age_secs = age.as_secs(),
                    max_age_secs = max_age.as_secs(),
                    "terminating runaway job"
                );
            }
        }

        reaped
    }

    /// Terminate every active job. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let mut cancelled = 0;
        for job in jobs.values_mut() {
            if job.status.is_active() && !job.cancel.is_cancelled() {
                job.kill_reason = Some(KillReason::Shutdown);
                job.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Job counts by state.
    pub fn stats(&self) -> JobStats {
        let jobs = self.jobs.lock();
        let mut stats = JobStats {
            pending: 0,
            running: 0,
            finished: 0,
            max_concurrent_jobs: self.settings.max_concurrent_jobs,
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                _ => stats.finished += 1,
            }
        }
        stats
    }
}

fn owned<'a>(
    jobs: &'a HashMap<JobId, JobEntry>,
    tenant: &TenantId,
    id: JobId,
) -> Result<&'a JobEntry> {
    jobs.get(&id)
        .filter(|job| &job.tenant == tenant)
        .ok_or(GovernorError::JobNotFound(id))
}

fn owned_mut<'a>(
    jobs: &'a mut HashMap<JobId, JobEntry>,
    tenant: &TenantId,
    id: JobId,
) -> Result<&'a mut JobEntry> {
    jobs.get_mut(&id)
        .filter(|job| &job.tenant == tenant)
        .ok_or(GovernorError::JobNotFound(id))
}

fn pump<R>(reader: R, source: OutputSource, output: Arc<OutputLog>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(MAX_CHUNK_BYTES);
        loop {
            // A chunk ends at a newline or once it reaches MAX_CHUNK_BYTES.
            let room = (MAX_CHUNK_BYTES - buf.len()) as u64;
            match (&mut reader).take(room).read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let end = buf.len() - incomplete_utf8_tail(&buf);
                    if end > 0 {
                        output.push(source, String::from_utf8_lossy(&buf[..end]).as_ref());
                        buf.drain(..end);
                    }
                }
                Err(e) => {
                    debug!(?source, error = %e, "output pipe closed with error");
                    break;
                }
            }
        }
        if !buf.is_empty() {
            output.push(source, String::from_utf8_lossy(&buf).as_ref());
        }
    })
}

/// Bytes of a multi-byte character cut off at the end of `buf`.
fn incomplete_utf8_tail(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Err(e) if e.error_len().is_none() => buf.len() - e.valid_up_to(),
        _ => 0,
    }
}

async fn supervise(
    jobs: JobTable,
    id: JobId,
    mut child: Child,
    pumps: [Option<JoinHandle<()>>; 2],
    output: Arc<OutputLog>,
    cancel: CancellationToken,
    kill_grace: Duration,
) {
    let pid = child.id();
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = cancel.cancelled() => None,
    };
    let (status, killed) = match exited {
        Some(status) => (status, false),
        None => (process::terminate(&mut child, kill_grace).await, true),
    };
    // Background children must not outlive the job or hold its pipes open.
    process::kill_leftovers(pid);

    for pump in pumps.into_iter().flatten() {
        let abort = pump.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
            abort.abort();
        }
    }
    output.close();

    let final_status = final_status(&status, killed);
    let exit_code = status.as_ref().ok().and_then(ExitStatus::code);

    let mut jobs = jobs.lock();
    let Some(job) = jobs.get_mut(&id) else {
        return;
    };
    job.exit_code = exit_code;
    job.finished = Some(Instant::now());
    job.finished_at = Some(Utc::now());
    job.set_status(final_status);

    match (&status, final_status) {
        (Err(e), _) => warn!(job = %id, error = %e, "lost track of job process"),
        (Ok(_), JobStatus::Killed) => warn!(
            job = %id,
            tenant = %job.tenant,
            reason = ?job.kill_reason,
            "job killed"
        ),
        (Ok(_), _) => info!(
            job = %id,
            tenant = %job.tenant,
            status = ?final_status,
            exit_code,
            "job finished"
        ),
    }
}

fn final_status(status: &std::io::Result<ExitStatus>, killed: bool) -> JobStatus {
    match status {
        _ if killed => JobStatus::Killed,
        Ok(status) if status.success() => JobStatus::Succeeded,
        _ => JobStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_characters_are_held_back() {
        let snowman = "\u{2603}".as_bytes();
        let mut buf = b"abc".to_vec();
        buf.extend_from_slice(&snowman[..2]);

        assert_eq!(incomplete_utf8_tail(&buf), 2);
        assert_eq!(incomplete_utf8_tail(b"abc\n"), 0);
        assert_eq!(incomplete_utf8_tail(snowman), 0);
    }
}
