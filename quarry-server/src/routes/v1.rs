use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    AppState,
    handlers::{governor, jobs, models, query, runs, workspaces},
    infra::middleware::rate_limit::rate_limit_middleware,
};

/// Create all v1 API routes. Every route sits behind the rate limiter.
pub fn create_v1_router(state: AppState) -> Router<AppState> {
    Router::new()
        .merge(create_workspace_routes())
        .merge(create_job_routes())
        .route("/query", post(query::query_handler))
        .route("/governor/stats", get(governor::stats_handler))
        .route("/governor/maintenance", post(governor::maintenance_handler))
        .route_layer(middleware::from_fn_with_state(
            state,
            rate_limit_middleware,
        ))
}

fn create_workspace_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/workspaces/{content_set}",
            post(workspaces::initialize_workspace_handler),
        )
        .route(
            "/workspaces/{content_set}/models",
            get(models::list_models_handler),
        )
        .route(
            "/workspaces/{content_set}/models/{name}",
            get(models::read_model_handler).put(models::write_model_handler),
        )
        .route(
            "/workspaces/{content_set}/runs",
            post(runs::start_run_handler),
        )
        .route(
            "/workspaces/{content_set}/seeds",
            post(runs::start_seed_handler),
        )
}

fn create_job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(jobs::list_jobs_handler))
        .route(
            "/jobs/{id}",
            get(jobs::job_status_handler).delete(jobs::cancel_job_handler),
        )
        .route("/jobs/{id}/logs", get(jobs::job_logs_handler))
}
