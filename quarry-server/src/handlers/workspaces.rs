use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use quarry_core::ContentSetId;
use serde_json::{Value, json};
use tracing::info;

use crate::infra::{app_state::AppState, errors::AppResult, tenant::Tenant};

/// Prepare (or reuse) the caller's workspace for a content set.
pub async fn initialize_workspace_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(content_set): Path<String>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let content_set = ContentSetId::new(content_set)?;
    state
        .governor
        .initialize_workspace(&tenant, &content_set)
        .await?;
    info!(%tenant, %content_set, "workspace ready");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "tenant": tenant,
            "content_set": content_set,
            "status": "ready",
        })),
    ))
}
