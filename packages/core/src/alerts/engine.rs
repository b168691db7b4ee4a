//! Alert engine: rule evaluation, deduplicated creation, operator-driven
//! status transitions and the retention sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::alerts::rules::{evaluate_all, RuleContext, RuleThresholds};
use crate::alerts::types::{Alert, AlertFilter, AlertStatus, RetentionReport};
use crate::metrics::AppMetrics;
use crate::repository::{AlertStore, ExamStore, StoreError};
use crate::sync::ExamSynced;

/// Resolved alerts older than this are purged by the retention sweep.
pub const DEFAULT_RETENTION_DAYS: i64 = 3;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Alert {id} not found")]
    NotFound { id: i64 },

    #[error("Exam {id} not found")]
    ExamNotFound { id: i64 },

    #[error("Alert {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: AlertStatus,
        to: AlertStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AlertEngine {
    exams: Arc<dyn ExamStore>,
    alerts: Arc<dyn AlertStore>,
    thresholds: RuleThresholds,
    retention: Duration,
    metrics: Option<Arc<AppMetrics>>,
}

impl AlertEngine {
    pub fn new(exams: Arc<dyn ExamStore>, alerts: Arc<dyn AlertStore>) -> Self {
        Self {
            exams,
            alerts,
            thresholds: RuleThresholds::default(),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            metrics: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: RuleThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Run the rule table against a stored exam and create the alerts that
    /// fired. Alerts that already have a pending twin are skipped; only the
    /// newly created ones are returned.
    pub async fn evaluate_exam(&self, exam_id: i64) -> Result<Vec<Alert>, AlertError> {
        let exam = self
            .exams
            .get_exam(exam_id)
            .await?
            .ok_or(AlertError::ExamNotFound { id: exam_id })?;

        let previous = self.exams.previous_exam(&exam).await?;
        let patient = match exam.patient_id {
            Some(patient_id) => self.exams.get_patient(patient_id).await?,
            None => None,
        };

        let ctx = RuleContext {
            exam: &exam,
            previous: previous.as_ref(),
            patient: patient.as_ref(),
        };

        let now = Utc::now();
        let mut created = Vec::new();
        for candidate in evaluate_all(&ctx, &self.thresholds) {
            match self.alerts.create_alert_if_absent(&candidate, now).await? {
                Some(alert) => {
                    tracing::info!(
                        "Alert {} raised: {} (exam {})",
                        alert.id,
                        alert.rule_key,
                        exam.external_id
                    );
                    created.push(alert);
                }
                None => tracing::debug!(
                    "Pending {} alert already exists for exam {}",
                    candidate.rule_key,
                    exam.external_id
                ),
            }
        }

        if let Some(m) = &self.metrics {
            m.alerts_created_total.inc_by(created.len() as f64);
        }
        Ok(created)
    }

    /// Consume sync notifications until every sender is dropped.
    ///
    /// A failed evaluation is logged and does not stop the listener.
    pub async fn process_sync_events(&self, mut events: mpsc::Receiver<ExamSynced>) -> usize {
        let mut processed = 0;
        while let Some(event) = events.recv().await {
            processed += 1;
            if let Err(err) = self.evaluate_exam(event.exam_id).await {
                tracing::error!("Alert evaluation failed for exam {}: {}", event.external_id, err);
            }
        }
        tracing::info!("Sync event listener stopped after {} events", processed);
        processed
    }

    pub async fn get(&self, id: i64) -> Result<Alert, AlertError> {
        self.alerts
            .get_alert(id)
            .await?
            .ok_or(AlertError::NotFound { id })
    }

    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, AlertError> {
        Ok(self.alerts.list_alerts(filter).await?)
    }

    pub async fn count(&self, filter: &AlertFilter) -> Result<i64, AlertError> {
        Ok(self.alerts.count_alerts(filter).await?)
    }

    /// Move an alert to `to` on behalf of `operator`.
    ///
    /// Without `force` only `pending → resolved` and `pending → ignored` are
    /// accepted. The write is guarded by the status that was read, so a
    /// concurrent transition makes this one fail instead of overwriting it.
    pub async fn transition(
        &self,
        id: i64,
        to: AlertStatus,
        operator: &str,
        force: bool,
    ) -> Result<Alert, AlertError> {
        let current = self.get(id).await?;
        if !force && !current.status.can_transition_to(to) {
            return Err(AlertError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }

        let moved = self
            .alerts
            .transition_alert(id, Some(current.status), to, Utc::now(), Some(operator))
            .await?;

        if !moved {
            let latest = self.get(id).await?;
            return Err(AlertError::InvalidTransition {
                id,
                from: latest.status,
                to,
            });
        }

        tracing::info!("Alert {} moved {} -> {} by {}", id, current.status, to, operator);
        self.get(id).await
    }

    /// Delete resolved alerts whose resolution is older than the retention
    /// window. Pending and ignored alerts are never touched.
    pub async fn run_retention_sweep(&self, now: DateTime<Utc>) -> Result<RetentionReport, AlertError> {
        let cutoff = now - self.retention;
        let deleted = self.alerts.delete_resolved_before(cutoff).await?;

        if let Some(m) = &self.metrics {
            m.alerts_deleted_total.inc_by(deleted as f64);
        }
        tracing::info!("Retention sweep removed {} resolved alerts (cutoff {})", deleted, cutoff);

        Ok(RetentionReport { deleted, cutoff })
    }
}
