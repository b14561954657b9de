//! Per-tenant working directories.
//!
//! Layout is `<root>/<tenant>/<content_set>/`. A workspace is built in a
//! hidden staging directory next to its final location and renamed into
//! place once the template copy and the generated profile are both on disk,
//! so a workspace directory is either absent or complete. Concurrent
//! `acquire` calls for one key are serialized through a per-key async
//! mutex; reclamation only ever `try_lock`s that mutex and skips busy keys.

mod fs_ops;
mod models;
mod profile;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GovernorError, Result};
use crate::ids::{ContentSetId, TenantId};
use crate::settings::WorkspaceSettings;

pub use models::ModelFile;
pub use profile::{DbtProfileRenderer, ProfileRenderer};

const STAGING_PREFIX: &str = ".staging-";

/// Identity of one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceKey {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Content set the workspace was built from.
    pub content_set: ContentSetId,
}

impl WorkspaceKey {
    /// Key for `(tenant, content_set)`.
    pub fn new(tenant: &TenantId, content_set: &ContentSetId) -> Self {
        Self {
            tenant: tenant.clone(),
            content_set: content_set.clone(),
        }
    }
}

/// In-memory record of a complete workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceEntry {
    /// Workspace directory.
    pub path: PathBuf,
    /// Creation time, or the directory mtime for adopted ones.
    pub created_at: DateTime<Utc>,
    /// Last use; reclamation ages entries by it.
    pub last_touched: DateTime<Utc>,
}

impl WorkspaceEntry {
    /// Entry for a complete workspace found on disk, touched at `now`.
    fn adopted(path: PathBuf, now: DateTime<Utc>) -> Self {
        let created_at = fs_ops::modified_at(&path).unwrap_or(now);
        Self {
            path,
            created_at,
            last_touched: now,
        }
    }
}

type Slot = Arc<Mutex<Option<WorkspaceEntry>>>;

/// Outcome of one [`WorkspaceStore::reclaim_expired`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Workspaces deleted.
    pub removed: usize,
    /// Disk space released.
    pub freed_bytes: u64,
    /// Tenant directories left empty and removed.
    pub tenants_removed: usize,
    /// Abandoned staging directories removed.
    pub staging_removed: usize,
    /// Workspaces skipped because an operation held them.
    pub skipped_busy: usize,
}

/// Store occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStats {
    /// Workspaces tracked in memory.
    pub tracked: usize,
    /// Root directory.
    pub root: PathBuf,
}

/// A directory found under the root that the in-memory registry may not know
/// about.
#[derive(Debug)]
struct DiskEntry {
    tenant: String,
    name: String,
    path: PathBuf,
    modified: Option<DateTime<Utc>>,
}

/// Creates, tracks and reclaims per-tenant workspaces.
pub struct WorkspaceStore {
    settings: WorkspaceSettings,
    renderer: Arc<dyn ProfileRenderer>,
    slots: DashMap<WorkspaceKey, Slot>,
}

impl std::fmt::Debug for WorkspaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceStore")
            .field("root", &self.settings.root)
            .field("tracked", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl WorkspaceStore {
    /// Store using `renderer` for the generated profile.
    pub fn new(
        settings: WorkspaceSettings,
        renderer: Arc<dyn ProfileRenderer>,
    ) -> Self {
        Self {
            settings,
            renderer,
            slots: DashMap::new(),
        }
    }

    /// Store that renders the default dbt profile from `settings.profile`.
    pub fn with_default_renderer(settings: WorkspaceSettings) -> Self {
        let renderer = Arc::new(DbtProfileRenderer::new(settings.profile.clone()));
        Self::new(settings, renderer)
    }

    /// Settings the store was built with.
    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    /// Directory a workspace lives in, whether or not it exists.
    pub fn path_for(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> PathBuf {
        self.settings
            .root
            .join(tenant.as_str())
            .join(content_set.as_str())
    }

    /// Return the workspace for `(tenant, content_set)`, creating it from the
    /// template on first use. Refreshes the last-used time.
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> Result<PathBuf> {
        let key = WorkspaceKey::new(tenant, content_set);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;
        let now = Utc::now();

        if let Some(entry) = guard.as_mut() {
            if self.is_initialized(&entry.path).await {
                entry.last_touched = now;
                return Ok(entry.path.clone());
            }
            warn!(
                tenant = %tenant,
                content_set = %content_set,
                "tracked workspace vanished from disk; recreating"
            );
            *guard = None;
        }

        let path = self.path_for(tenant, content_set);
        if self.is_initialized(&path).await {
            debug!(path = %path.display(), "adopting existing workspace");
            *guard = Some(WorkspaceEntry::adopted(path.clone(), now));
            return Ok(path);
        }

        self.initialize(tenant, content_set, &path).await?;
        info!(
            tenant = %tenant,
            content_set = %content_set,
            path = %path.display(),
            "workspace initialized"
        );
        *guard = Some(WorkspaceEntry {
            path: path.clone(),
            created_at: now,
            last_touched: now,
        });
        Ok(path)
    }

    /// Refresh the last-used time. A no-op when no workspace is tracked.
    pub async fn touch(&self, tenant: &TenantId, content_set: &ContentSetId) {
        let key = WorkspaceKey::new(tenant, content_set);
        let Some(slot) = self.slots.get(&key).map(|s| s.value().clone()) else {
            debug!(tenant = %tenant, content_set = %content_set, "touch on unknown workspace");
            return;
        };

        let mut guard = slot.lock().await;
        if let Some(entry) = guard.as_mut() {
            entry.last_touched = Utc::now();
        }
    }

    /// Delete every workspace unused for longer than `max_age` as of `now`,
    /// then sweep stale staging directories and empty tenant directories.
    /// Workspaces whose slot is held by an in-progress operation are skipped.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let max_age = chrono::Duration::from_std(self.settings.max_age())
            .unwrap_or(chrono::Duration::MAX);
        let is_expired = |at: DateTime<Utc>| now.signed_duration_since(at) > max_age;
        let mut report = ReclaimReport::default();

        let tracked: Vec<(WorkspaceKey, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (key, slot) in tracked {
            let Ok(mut guard) = slot.try_lock() else {
                report.skipped_busy += 1;
                continue;
            };

            if let Some(entry) = guard.as_ref()
                && is_expired(entry.last_touched)
            {
                let path = entry.path.clone();
                match remove_workspace(&path).await {
                    Ok(freed) => {
                        report.removed += 1;
                        report.freed_bytes += freed;
                        *guard = None;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to remove workspace");
                    }
                }
            }

            let vacant = guard.is_none();
            drop(guard);
            if vacant {
                self.forget(&key, &slot);
            }
        }

        let disk = self.scan_root().await?;
        let mut tenant_dirs: Vec<PathBuf> = Vec::new();

        for item in disk {
            let tenant_dir = self.settings.root.join(&item.tenant);
            if !tenant_dirs.contains(&tenant_dir) {
                tenant_dirs.push(tenant_dir);
            }

            let expired = item.modified.is_none_or(is_expired);

            if item.name.starts_with(STAGING_PREFIX) {
                if expired {
                    match fs::remove_dir_all(&item.path).await {
                        Ok(()) => report.staging_removed += 1,
                        Err(e) => {
                            warn!(path = %item.path.display(), error = %e, "failed to remove staging directory");
                        }
                    }
                }
                continue;
            }

            let (Ok(tenant), Ok(content_set)) = (
                TenantId::new(item.tenant.as_str()),
                ContentSetId::new(item.name.as_str()),
            ) else {
                continue;
            };
            let key = WorkspaceKey::new(&tenant, &content_set);
            let slot = self.slot(&key);
            let Ok(guard) = slot.try_lock() else {
                report.skipped_busy += 1;
                continue;
            };

            // Tracked workspaces were aged above by their last-touched time.
            if guard.is_none() && expired {
                match remove_workspace(&item.path).await {
                    Ok(freed) => {
                        report.removed += 1;
                        report.freed_bytes += freed;
                    }
                    Err(e) => {
                        warn!(path = %item.path.display(), error = %e, "failed to remove untracked workspace");
                    }
                }
            }

            let vacant = guard.is_none();
            drop(guard);
            if vacant {
                self.forget(&key, &slot);
            }
        }

        for dir in tenant_dirs {
            if is_empty_dir(&dir).await && fs::remove_dir(&dir).await.is_ok() {
                report.tenants_removed += 1;
            }
        }

        if report.removed > 0 || report.staging_removed > 0 {
            info!(
                removed = report.removed,
                freed_bytes = report.freed_bytes,
                tenants_removed = report.tenants_removed,
                staging_removed = report.staging_removed,
                skipped_busy = report.skipped_busy,
                "workspace reclamation completed"
            );
        } else {
            debug!(
                skipped_busy = report.skipped_busy,
                "workspace reclamation found nothing to remove"
            );
        }

        Ok(report)
    }

    /// Current occupancy.
    pub fn stats(&self) -> WorkspaceStats {
        WorkspaceStats {
            tracked: self.slots.len(),
            root: self.settings.root.clone(),
        }
    }

    fn slot(&self, key: &WorkspaceKey) -> Slot {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    /// Drop an empty slot unless another caller is about to use it.
    fn forget(&self, key: &WorkspaceKey, slot: &Slot) {
        self.slots.remove_if(key, |_, current| {
            Arc::ptr_eq(current, slot) && Arc::strong_count(current) == 2
        });
    }

    async fn is_initialized(&self, path: &Path) -> bool {
        fs::try_exists(path.join(self.renderer.file_name()))
            .await
            .unwrap_or(false)
    }

    async fn initialize(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
        target: &Path,
    ) -> Result<()> {
        let template = self.settings.template_dir.clone();
        if !fs::try_exists(&template).await.unwrap_or(false) {
            return Err(GovernorError::WorkspaceInit {
                path: target.to_path_buf(),
                reason: format!("template directory {} is missing", template.display()),
                source: None,
            });
        }

        let tenant_dir = self.settings.root.join(tenant.as_str());
        let staging = tenant_dir.join(format!(
            "{STAGING_PREFIX}{content_set}-{}",
            Uuid::new_v4().simple()
        ));

        if let Err(err) = self.populate(&template, &staging, tenant, content_set).await {
            discard_staging(&staging).await;
            return Err(err);
        }

        if fs::try_exists(target).await.unwrap_or(false) {
            // Leftover without a profile: never completed, safe to replace.
            if let Err(e) = fs::remove_dir_all(target).await {
                discard_staging(&staging).await;
                return Err(GovernorError::workspace_init(
                    target,
                    "failed to remove incomplete workspace",
                    e,
                ));
            }
        }

        if let Err(e) = fs::rename(&staging, target).await {
            discard_staging(&staging).await;
            return Err(GovernorError::workspace_init(
                target,
                "failed to move staged workspace into place",
                e,
            ));
        }

        Ok(())
    }

    async fn populate(
        &self,
        template: &Path,
        staging: &Path,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> Result<()> {
        let src = template.to_path_buf();
        let dst = staging.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || fs_ops::copy_tree(&src, &dst))
            .await
            .map_err(|e| {
                GovernorError::workspace_init(staging, "template copy task failed", std::io::Error::other(e))
            })?
            .map_err(|e| GovernorError::workspace_init(staging, "failed to copy template", e))?;
        debug!(staging = %staging.display(), bytes = copied, "template copied");

        let profile = self.renderer.render(tenant, content_set);
        fs::write(staging.join(self.renderer.file_name()), profile)
            .await
            .map_err(|e| {
                GovernorError::workspace_init(staging, "failed to write profile", e)
            })?;

        Ok(())
    }

    async fn scan_root(&self) -> Result<Vec<DiskEntry>> {
        let root = self.settings.root.clone();
        let entries = tokio::task::spawn_blocking(move || scan_root_blocking(&root))
            .await
            .map_err(std::io::Error::other)??;
        Ok(entries)
    }
}

fn scan_root_blocking(root: &Path) -> std::io::Result<Vec<DiskEntry>> {
    let mut found = Vec::new();
    let tenants = match std::fs::read_dir(root) {
        Ok(tenants) => tenants,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };

    for tenant in tenants.flatten() {
        if !tenant.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let tenant_name = tenant.file_name().to_string_lossy().into_owned();
        let Ok(children) = std::fs::read_dir(tenant.path()) else {
            continue;
        };

        let mut any = false;
        for child in children.flatten() {
            if !child.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            any = true;
            let path = child.path();
            found.push(DiskEntry {
                tenant: tenant_name.clone(),
                name: child.file_name().to_string_lossy().into_owned(),
                modified: fs_ops::modified_at(&path),
                path,
            });
        }

        // Still report the tenant so an empty directory can be removed.
        if !any {
            found.push(DiskEntry {
                tenant: tenant_name,
                name: String::new(),
                path: tenant.path(),
                modified: None,
            });
        }
    }

    Ok(found)
}

async fn remove_workspace(path: &Path) -> std::io::Result<u64> {
    let measured = path.to_path_buf();
    let size = tokio::task::spawn_blocking(move || fs_ops::dir_size(&measured))
        .await
        .unwrap_or(0);
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn discard_staging(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %staging.display(), error = %e, "failed to clean up staging directory");
    }
}

async fn is_empty_dir(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &Path) -> WorkspaceStore {
        let template = base.join("template");
        std::fs::create_dir_all(&template).unwrap();
        std::fs::write(template.join("dbt_project.yml"), "name: t\n").unwrap();
        WorkspaceStore::with_default_renderer(WorkspaceSettings {
            root: base.join("root"),
            template_dir: template,
            ..WorkspaceSettings::default()
        })
    }

    #[tokio::test]
    async fn reclamation_skips_workspaces_in_use() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path());
        let tenant = TenantId::new("u1").unwrap();
        let lesson = ContentSetId::new("l1").unwrap();
        let path = store.acquire(&tenant, &lesson).await.unwrap();

        let slot = store.slot(&WorkspaceKey::new(&tenant, &lesson));
        let held = slot.lock().await;
        let far_future = Utc::now() + chrono::Duration::days(30);

        let report = store.reclaim_expired(far_future).await.unwrap();
        assert_eq!(report.removed, 0);
        assert!(report.skipped_busy >= 1);
        assert!(path.exists());

        drop(held);
        let report = store.reclaim_expired(far_future).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn incomplete_directory_is_replaced() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path());
        let tenant = TenantId::new("u1").unwrap();
        let lesson = ContentSetId::new("l1").unwrap();
        let target = store.path_for(&tenant, &lesson);
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("half-written"), "x").unwrap();

        let path = store.acquire(&tenant, &lesson).await.unwrap();

        assert!(path.join("profiles.yml").is_file());
        assert!(!path.join("half-written").exists());
    }
}
