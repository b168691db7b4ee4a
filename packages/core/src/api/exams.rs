//! Patient evolution: how a patient's exams compare over time.
//!
//! `GET /patients/:id/evolution`

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::clinical::{compare_metrics, first_and_last_exam, worst_and_best_exam, Exam, MetricComparison};
use crate::error::AppError;
use crate::repository::ExamStore;

pub type ExamsState = Arc<dyn ExamStore>;

pub fn create_exams_router(store: ExamsState) -> Router {
    Router::new()
        .route("/patients/:id/evolution", get(patient_evolution))
        .with_state(store)
}

#[derive(Debug, Serialize)]
pub struct EvolutionResponse {
    pub patient_id: i64,
    pub adiposity_index: Option<f64>,
    pub adherence_percentage: Option<f64>,
    pub exam_count: usize,
    pub first_exam: Option<Exam>,
    pub last_exam: Option<Exam>,
    /// Empty when first and last exam differ in type.
    pub comparison: Vec<MetricComparison>,
    pub worst_sleep_exam: Option<Exam>,
    pub best_sleep_exam: Option<Exam>,
}

pub async fn patient_evolution(
    State(store): State<ExamsState>,
    Path(patient_id): Path<i64>,
) -> Result<Json<EvolutionResponse>, AppError> {
    let patient = store
        .get_patient(patient_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Patient {} not found", patient_id)))?;

    let exams = store.patient_exams(patient_id).await?;
    let span = first_and_last_exam(&exams);
    let extremes = worst_and_best_exam(&exams);

    Ok(Json(EvolutionResponse {
        patient_id,
        adiposity_index: patient.adiposity_index(),
        adherence_percentage: patient.adherence_percentage(),
        exam_count: exams.len(),
        comparison: compare_metrics(span.first, span.last),
        first_exam: span.first.cloned(),
        last_exam: span.last.cloned(),
        worst_sleep_exam: extremes.first.cloned(),
        best_sleep_exam: extremes.last.cloned(),
    }))
}
