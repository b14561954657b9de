use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use quarry_core::{ContentSetId, ModelName, jobs::JobId};
use serde::{Deserialize, Serialize};

use crate::infra::{app_state::AppState, errors::AppResult, tenant::Tenant};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    /// Models to select; empty runs the whole project.
    pub models: Vec<ModelName>,
    /// Also select everything downstream of `models`.
    pub include_children: bool,
    pub full_refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
}

pub async fn start_run_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(content_set): Path<String>,
    Json(request): Json<RunRequest>,
) -> AppResult<(StatusCode, Json<JobAccepted>)> {
    let content_set = ContentSetId::new(content_set)?;
    let job_id = state
        .governor
        .start_run(
            &tenant,
            &content_set,
            request.models,
            request.include_children,
            request.full_refresh,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

pub async fn start_seed_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(content_set): Path<String>,
) -> AppResult<(StatusCode, Json<JobAccepted>)> {
    let content_set = ContentSetId::new(content_set)?;
    let job_id = state.governor.start_seed(&tenant, &content_set).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}
