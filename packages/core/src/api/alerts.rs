//! Alert consumer endpoints.
//!
//! Routes:
//! - `GET   /alerts`           : filtered listing (`type`, `urgency`, `status`, `patient_id`, `limit`)
//! - `GET   /alerts/:id`       : single alert
//! - `PATCH /alerts/:id/status`: operator transition; needs `X-Operator-Id`

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::alerts::{Alert, AlertEngine, AlertFilter, AlertStatus};
use crate::error::AppError;

/// Header carrying the operator identity, set by the authenticating proxy.
pub const OPERATOR_HEADER: &str = "x-operator-id";

/// Shared state for the alerts routes.
pub type AlertsState = Arc<AlertEngine>;

pub fn create_alerts_router(engine: AlertsState) -> Router {
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id", get(get_alert))
        .route("/alerts/:id/status", patch(update_alert_status))
        .with_state(engine)
}

// ---- Request / response shapes ----

#[derive(Debug, Serialize)]
pub struct AlertListResponse {
    pub total: i64,
    pub items: Vec<Alert>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: AlertStatus,
    /// Operator override: allow transitions out of a terminal status.
    #[serde(default)]
    pub force: bool,
}

fn operator_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", OPERATOR_HEADER)))
}

// ---- Handlers ----

/// `GET /alerts`: newest first; `total` counts every match, ignoring `limit`.
pub async fn list_alerts(
    State(engine): State<AlertsState>,
    Query(filter): Query<AlertFilter>,
) -> Result<Json<AlertListResponse>, AppError> {
    let (items, total) = tokio::try_join!(engine.list(&filter), engine.count(&filter))?;
    Ok(Json(AlertListResponse { total, items }))
}

/// `GET /alerts/:id`
pub async fn get_alert(
    State(engine): State<AlertsState>,
    Path(id): Path<i64>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(engine.get(id).await?))
}

/// `PATCH /alerts/:id/status`
pub async fn update_alert_status(
    State(engine): State<AlertsState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<StatusUpdateRequest>,
) -> Result<Json<Alert>, AppError> {
    let operator = operator_id(&headers)?;
    let alert = engine.transition(id, body.status, &operator, body.force).await?;
    Ok(Json(alert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::alerts::{AlertType, AlertUrgency, NewAlert};
    use crate::db::create_pool;
    use crate::repository::{AlertStore, ClinicalRepository};

    async fn make_app() -> (Router, Arc<ClinicalRepository>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let repo = Arc::new(ClinicalRepository::new(pool));
        let engine = Arc::new(AlertEngine::new(repo.clone(), repo.clone()));
        (create_alerts_router(engine), repo)
    }

    async fn seed(repo: &ClinicalRepository, rule: &str, urgency: AlertUrgency) -> i64 {
        let alert = NewAlert {
            alert_type: AlertType::Critical,
            urgency,
            title: "Severe sleep apnea".into(),
            message: "Apnea index of 42 events/h".into(),
            patient_id: Some(1),
            exam_id: Some(1),
            rule_key: rule.into(),
            payload: serde_json::json!({ "apnea_index": 42.0 }),
        };
        repo.create_alert_if_absent(&alert, Utc::now()).await.unwrap().unwrap().id
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn patch_status(id: i64, body: &str, operator: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::PATCH)
            .uri(format!("/alerts/{}/status", id))
            .header("content-type", "application/json");
        if let Some(op) = operator {
            builder = builder.header("X-Operator-Id", op);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn list_filters_by_urgency() {
        let (app, repo) = make_app().await;
        seed(&repo, "severe_apnea", AlertUrgency::High).await;
        seed(&repo, "low_sleep_efficiency", AlertUrgency::Low).await;

        let req = Request::builder().uri("/alerts?urgency=low").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["rule_key"], "low_sleep_efficiency");
    }

    #[tokio::test]
    async fn list_rejects_unknown_status() {
        let (app, _) = make_app().await;
        let req = Request::builder().uri("/alerts?status=archived").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_missing_alert_returns_404() {
        let (app, _) = make_app().await;
        let req = Request::builder().uri("/alerts/77").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_without_operator_returns_401() {
        let (app, repo) = make_app().await;
        let id = seed(&repo, "severe_apnea", AlertUrgency::High).await;

        let resp = app
            .oneshot(patch_status(id, r#"{"status":"resolved"}"#, None))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn patch_resolves_and_records_operator() {
        let (app, repo) = make_app().await;
        let id = seed(&repo, "severe_apnea", AlertUrgency::High).await;

        let resp = app
            .oneshot(patch_status(id, r#"{"status":"resolved"}"#, Some("nurse-12")))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["status"], "resolved");
        assert_eq!(json["resolved_by"], "nurse-12");
    }

    #[tokio::test]
    async fn patch_illegal_transition_returns_409() {
        let (app, repo) = make_app().await;
        let id = seed(&repo, "severe_apnea", AlertUrgency::High).await;

        app.clone()
            .oneshot(patch_status(id, r#"{"status":"ignored"}"#, Some("op")))
            .await
            .unwrap();
        let resp = app
            .oneshot(patch_status(id, r#"{"status":"resolved"}"#, Some("op")))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn patch_with_force_overrides_terminal_status() {
        let (app, repo) = make_app().await;
        let id = seed(&repo, "severe_apnea", AlertUrgency::High).await;

        app.clone()
            .oneshot(patch_status(id, r#"{"status":"ignored"}"#, Some("op")))
            .await
            .unwrap();
        let resp = app
            .oneshot(patch_status(id, r#"{"status":"resolved","force":true}"#, Some("lead")))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["resolved_by"], "lead");
    }
}
