use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use quarry_core::{ContentSetId, ModelName, workspace::ModelFile};
use serde::{Deserialize, Serialize};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
    tenant::Tenant,
};

#[derive(Debug, Serialize)]
pub struct ModelContents {
    pub name: ModelName,
    pub contents: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteModelRequest {
    pub contents: String,
}

pub async fn list_models_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(content_set): Path<String>,
) -> AppResult<Json<Vec<ModelFile>>> {
    let content_set = ContentSetId::new(content_set)?;
    let models = state.governor.list_models(&tenant, &content_set).await?;
    Ok(Json(models))
}

pub async fn read_model_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((content_set, name)): Path<(String, String)>,
) -> AppResult<Json<ModelContents>> {
    let content_set = ContentSetId::new(content_set)?;
    let name = ModelName::new(name)?;

    match state
        .governor
        .read_model(&tenant, &content_set, &name)
        .await?
    {
        Some(contents) => Ok(Json(ModelContents { name, contents })),
        None => Err(AppError::not_found(format!("model {name} not found"))),
    }
}

pub async fn write_model_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((content_set, name)): Path<(String, String)>,
    Json(request): Json<WriteModelRequest>,
) -> AppResult<StatusCode> {
    let content_set = ContentSetId::new(content_set)?;
    let name = ModelName::new(name)?;

    state
        .governor
        .write_model(&tenant, &content_set, &name, &request.contents)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
