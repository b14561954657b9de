use axum::{extract::State, response::Json};
use quarry_core::pool::QueryResult;
use serde::Deserialize;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
    tenant::Tenant,
};

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

/// Run ad-hoc SQL in the caller's namespace.
pub async fn query_handler(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(request): Json<QueryRequest>,
) -> AppResult<Json<QueryResult>> {
    let sql = request.sql.trim();
    if sql.is_empty() {
        return Err(AppError::bad_request("sql must not be empty"));
    }
    let result = state.governor.run_query(&tenant, sql).await?;
    Ok(Json(result))
}
