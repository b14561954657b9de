use axum::{extract::State, response::Json};
use quarry_core::{GovernorStats, MaintenanceReport};

use crate::infra::{app_state::AppState, errors::AppResult};

pub async fn stats_handler(State(state): State<AppState>) -> Json<GovernorStats> {
    Json(state.governor.stats())
}

/// Runs every reclamation step now instead of waiting for the timers.
pub async fn maintenance_handler(
    State(state): State<AppState>,
) -> AppResult<Json<MaintenanceReport>> {
    Ok(Json(state.governor.maintenance_pass().await?))
}
