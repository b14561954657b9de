use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        Json,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt, stream};
use quarry_core::jobs::{JobId, JobSnapshot};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
    tenant::Tenant,
};

fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid job id {raw:?}")))
}

pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Json<Vec<JobSnapshot>> {
    Json(state.governor.list_jobs(&tenant))
}

pub async fn job_status_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> AppResult<Json<JobSnapshot>> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.governor.job_status(&tenant, id)?))
}

pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> AppResult<(StatusCode, Json<JobSnapshot>)> {
    let id = parse_job_id(&id)?;
    let snapshot = state.governor.cancel_job(&tenant, id)?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// Streams job output as `output` events, then one `status` event with the
/// final snapshot. Disconnecting does not affect the job.
pub async fn job_logs_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, anyhow::Error>>>> {
    let id = parse_job_id(&id)?;
    let output = state.governor.attach_output(&tenant, id)?;
    let governor = Arc::clone(&state.governor);

    let events = output.map(|event| {
        Event::default()
            .event("output")
            .json_data(&event)
            .map_err(anyhow::Error::from)
    });
    let status = stream::once(async move {
        match governor.wait_job(&tenant, id).await {
            Ok(snapshot) => Event::default()
                .event("status")
                .json_data(&snapshot)
                .map_err(anyhow::Error::from),
            Err(_) => Ok(Event::default().comment("job no longer tracked")),
        }
    });

    Ok(Sse::new(events.chain(status)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    ))
}
