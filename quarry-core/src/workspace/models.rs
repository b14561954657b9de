use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tracing::debug;

use super::{WorkspaceEntry, WorkspaceKey, WorkspaceStore};
use crate::error::{GovernorError, Result};
use crate::ids::{ContentSetId, ModelName, TenantId};

const MODEL_EXTENSION: &str = "sql";

/// An editable model file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelFile {
    /// Model name, without extension.
    pub name: ModelName,
    /// Size in bytes.
    pub size: u64,
}

impl WorkspaceStore {
    /// Model files in the workspace's model directory, sorted by name.
    /// Files whose stem is not a valid model name are ignored.
    pub async fn list_models(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> Result<Vec<ModelFile>> {
        let dir = self.model_dir(tenant, content_set).await?;
        let mut models = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(models),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MODEL_EXTENSION) {
                continue;
            }
            let Some(name) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| ModelName::new(s).ok())
            else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                models.push(ModelFile {
                    name,
                    size: metadata.len(),
                });
            }
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Contents of one model, or `None` when it does not exist.
    pub async fn read_model(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
        model: &ModelName,
    ) -> Result<Option<String>> {
        let path = self.model_dir(tenant, content_set).await?.join(file_name(model));
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create or replace a model file.
    pub async fn write_model(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
        model: &ModelName,
        contents: &str,
    ) -> Result<()> {
        let dir = self.model_dir(tenant, content_set).await?;
        fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name(model));
        fs::write(&path, contents).await?;
        debug!(path = %path.display(), bytes = contents.len(), "model saved");
        Ok(())
    }

    /// Model directory of an existing workspace; touches it on the way.
    /// A complete workspace left on disk by an earlier process is adopted.
    async fn model_dir(
        &self,
        tenant: &TenantId,
        content_set: &ContentSetId,
    ) -> Result<PathBuf> {
        let key = WorkspaceKey::new(tenant, content_set);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;
        let now = Utc::now();

        if let Some(entry) = guard.as_mut() {
            entry.last_touched = now;
            return Ok(entry.path.join(&self.settings.model_dir));
        }

        let path = self.path_for(tenant, content_set);
        if self.is_initialized(&path).await {
            debug!(path = %path.display(), "adopting existing workspace");
            let dir = path.join(&self.settings.model_dir);
            *guard = Some(WorkspaceEntry::adopted(path, now));
            return Ok(dir);
        }

        drop(guard);
        self.forget(&key, &slot);
        Err(GovernorError::WorkspaceNotFound {
            tenant: tenant.to_string(),
            content_set: content_set.to_string(),
        })
    }
}

fn file_name(model: &ModelName) -> String {
    format!("{model}.{MODEL_EXTENSION}")
}
