//! # Quarry Server
//!
//! Thin axum boundary over the execution governor. Handlers translate a
//! request into one governor operation and map the outcome to HTTP; all
//! resource decisions (admission, pooling, rate limits, workspace lifetime)
//! are made in `quarry-core`.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
