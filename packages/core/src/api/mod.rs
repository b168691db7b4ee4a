//! HTTP surface.
//!
//! Each submodule exposes a `create_*_router` builder over its own state;
//! [`create_router`] merges them the same way `main.rs` serves them.

pub mod alerts;
pub mod exams;
pub mod health;
pub mod jobs;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::alerts::AlertEngine;
use crate::metrics::AppMetrics;
use crate::repository::ExamStore;
use crate::sync::SyncEngine;

/// Everything the router needs.
#[derive(Clone)]
pub struct AppState {
    pub exams: Arc<dyn ExamStore>,
    pub sync: Arc<SyncEngine>,
    pub alerts: Arc<AlertEngine>,
    pub metrics: Arc<AppMetrics>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .merge(
            Router::new()
                .route("/metrics", get(render_metrics))
                .with_state(state.metrics.clone()),
        )
        .merge(alerts::create_alerts_router(state.alerts.clone()))
        .merge(jobs::create_jobs_router(jobs::JobsState {
            sync: state.sync.clone(),
            alerts: state.alerts.clone(),
        }))
        .merge(exams::create_exams_router(state.exams.clone()))
        .layer(middleware::from_fn_with_state(state.metrics.clone(), track_http))
        .layer(cors)
}

/// `GET /metrics`: Prometheus text exposition.
async fn render_metrics(State(metrics): State<Arc<AppMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            Body::from(body),
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Failed to render metrics: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics error").into_response()
        }
    }
}

/// Count and time every request, labelled by its route template.
async fn track_http(State(metrics): State<Arc<AppMetrics>>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let started = Instant::now();
    let response = next.run(req).await;

    metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), path.as_str(), response.status().as_str()])
        .inc();
    metrics
        .http_request_duration
        .observe(started.elapsed().as_secs_f64());

    response
}
