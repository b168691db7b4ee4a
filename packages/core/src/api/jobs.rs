//! HTTP triggers for the two scheduled jobs.
//!
//! - `POST /jobs/sync`     : run one sync cycle, return its report
//! - `POST /jobs/retention`: run one retention sweep, return its report

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;

use crate::alerts::{AlertEngine, RetentionReport};
use crate::error::AppError;
use crate::sync::{SyncEngine, SyncReport};

#[derive(Clone)]
pub struct JobsState {
    pub sync: Arc<SyncEngine>,
    pub alerts: Arc<AlertEngine>,
}

pub fn create_jobs_router(state: JobsState) -> Router {
    Router::new()
        .route("/jobs/sync", post(run_sync))
        .route("/jobs/retention", post(run_retention))
        .with_state(state)
}

/// A cycle already running elsewhere is waited for, not duplicated.
pub async fn run_sync(State(state): State<JobsState>) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(state.sync.run_cycle().await?))
}

pub async fn run_retention(State(state): State<JobsState>) -> Result<Json<RetentionReport>, AppError> {
    Ok(Json(state.alerts.run_retention_sweep(Utc::now()).await?))
}
