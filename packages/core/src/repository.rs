//! Record store adapter.
//!
//! All SQLite read/write logic lives here, behind two seams:
//! [`ExamStore`] (used by the sync engine) and [`AlertStore`] (used by the
//! alert engine and the API). [`ClinicalRepository`] implements both.
//!
//! Schema drift is reported as an explicit [`StoreError::UnknownColumn`]
//! so callers never have to inspect error text.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::alerts::types::{Alert, AlertFilter, AlertStatus, NewAlert};
use crate::clinical::{Exam, NewPatient, Patient};
use crate::db;
use crate::schema::{content_hash, exam_columns, format_timestamp, ColumnValue, FieldTier};

/// Maximum number of alerts a single listing may return.
pub const MAX_ALERT_PAGE: i64 = 200;

/// Errors from the record store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A write referenced a column the schema does not (yet) have.
    #[error("Unknown column '{field}'")]
    UnknownColumn { field: String },

    /// Constraint violation or row that cannot be decoded.
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    #[error("Store rejected credentials: {message}")]
    Unauthorized { message: String },

    #[error("Database error: {message}")]
    Database { message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message();
            // Backstop for schema changes racing with the cached column set.
            for marker in ["has no column named ", "no such column: "] {
                if let Some(pos) = message.find(marker) {
                    let field = message[pos + marker.len()..]
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    return StoreError::UnknownColumn { field };
                }
            }
            if db_err.is_unique_violation()
                || db_err.is_foreign_key_violation()
                || db_err.is_check_violation()
            {
                return StoreError::Integrity { message: message.to_string() };
            }
            if message.contains("readonly") || message.contains("authorization") {
                return StoreError::Unauthorized { message: message.to_string() };
            }
        }
        StoreError::Database { message: err.to_string() }
    }
}

/// What an exam upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { id: i64 },
    Updated { id: i64 },
    /// Same content already stored; nothing written.
    Unchanged { id: i64 },
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Created { id }
            | UpsertOutcome::Updated { id }
            | UpsertOutcome::Unchanged { id } => *id,
        }
    }
}

/// Exam and patient access needed by the sync and alert engines.
#[async_trait]
pub trait ExamStore: Send + Sync {
    /// Idempotent upsert keyed by the partner's external id, writing only the
    /// columns of `tier`. All-or-nothing per record.
    async fn upsert_exam(&self, exam: &Exam, tier: FieldTier) -> Result<UpsertOutcome, StoreError>;

    async fn get_exam(&self, id: i64) -> Result<Option<Exam>, StoreError>;

    async fn get_exam_by_external_id(&self, external_id: &str) -> Result<Option<Exam>, StoreError>;

    /// Latest exam of the same patient and type dated before `exam`.
    async fn previous_exam(&self, exam: &Exam) -> Result<Option<Exam>, StoreError>;

    /// All exams of a patient, oldest first.
    async fn patient_exams(&self, patient_id: i64) -> Result<Vec<Exam>, StoreError>;

    async fn get_patient(&self, id: i64) -> Result<Option<Patient>, StoreError>;
}

/// Alert persistence needed by the alert engine.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert unless a pending alert exists for the same (rule, patient,
    /// exam). Returns `None` when deduplicated.
    async fn create_alert_if_absent(
        &self,
        alert: &NewAlert,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StoreError>;

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>, StoreError>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError>;

    async fn count_alerts(&self, filter: &AlertFilter) -> Result<i64, StoreError>;

    /// Move an alert to `to`. When `expected` is set the update only applies
    /// if the alert is still in that status. Returns `true` if a row changed.
    async fn transition_alert(
        &self,
        id: i64,
        expected: Option<AlertStatus>,
        to: AlertStatus,
        at: DateTime<Utc>,
        by: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Single delete-by-predicate of resolved alerts closed before `cutoff`.
    async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// SQLite-backed record store.
pub struct ClinicalRepository {
    pool: SqlitePool,
    exam_columns: RwLock<Option<HashSet<String>>>,
}

impl ClinicalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            exam_columns: RwLock::new(None),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Forget the cached exam column set, e.g. after applying a migration.
    pub async fn refresh_schema(&self) {
        *self.exam_columns.write().await = None;
    }

    async fn known_exam_columns(&self) -> Result<HashSet<String>, StoreError> {
        if let Some(columns) = self.exam_columns.read().await.as_ref() {
            return Ok(columns.clone());
        }
        let columns = db::exam_columns(&self.pool).await?;
        *self.exam_columns.write().await = Some(columns.clone());
        Ok(columns)
    }

    // ---- Patients ----

    /// Register a patient. Used by the intake collaborator; the engines
    /// only read patients.
    pub async fn insert_patient(&self, patient: &NewPatient) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO patients
             (external_id, name, weight_kg, height_cm, therapy_sessions_used, therapy_sessions_prescribed, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&patient.external_id)
        .bind(&patient.name)
        .bind(patient.weight_kg)
        .bind(patient.height_cm)
        .bind(patient.therapy_sessions_used)
        .bind(patient.therapy_sessions_prescribed)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: ColumnValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        ColumnValue::Text(v) => query.bind(v),
        ColumnValue::Real(v) => query.bind(v),
        ColumnValue::Int(v) => query.bind(v),
        ColumnValue::Bool(v) => query.bind(v),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Optional column read that tolerates the column being absent (basic-level
/// schemas have no extended columns).
fn opt<'r, T>(row: &'r SqliteRow, column: &str) -> Option<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get::<Option<T>, _>(column).ok().flatten()
}

fn exam_from_row(row: &SqliteRow) -> Option<Exam> {
    let exam_type = row.try_get::<String, _>("exam_type").ok()?.parse().ok()?;
    let exam_date = parse_timestamp(&row.try_get::<String, _>("exam_date").ok()?)?;

    let mut exam = Exam::new(row.try_get::<String, _>("external_id").ok()?, exam_type, exam_date);
    exam.id = Some(row.try_get("id").ok()?);
    exam.exam_key = opt(row, "exam_key");
    exam.patient_id = opt(row, "patient_id");
    exam.patient_external_id = opt(row, "patient_external_id");
    exam.status = row.try_get("status").ok()?;
    exam.weight_kg = opt(row, "weight_kg");
    exam.height_cm = opt(row, "height_cm");
    exam.bmi = opt(row, "bmi");
    exam.apnea_index = opt(row, "apnea_index");
    exam.apnea_category = opt(row, "apnea_category");
    exam.spo2_min = opt(row, "spo2_min");
    exam.spo2_avg = opt(row, "spo2_avg");
    exam.spo2_max = opt(row, "spo2_max");
    exam.snoring_score = opt(row, "snoring_score");

    exam.snore_low_pct = opt(row, "snore_low_pct");
    exam.snore_medium_pct = opt(row, "snore_medium_pct");
    exam.snore_high_pct = opt(row, "snore_high_pct");
    exam.hr_min = opt(row, "hr_min");
    exam.hr_avg = opt(row, "hr_avg");
    exam.hr_max = opt(row, "hr_max");
    exam.hypoxic_burden = opt(row, "hypoxic_burden");
    exam.desat_count = opt(row, "desat_count");
    exam.time_below_90_s = opt(row, "time_below_90_s");
    exam.duration_s = opt(row, "duration_s");
    exam.sleep_efficiency = opt(row, "sleep_efficiency");
    exam.sleep_start = opt(row, "sleep_start").and_then(|raw: String| parse_timestamp(&raw));
    exam.sleep_end = opt(row, "sleep_end").and_then(|raw: String| parse_timestamp(&raw));
    exam.af_detected = opt(row, "af_detected");
    exam.cond_hypertension = opt(row, "cond_hypertension");
    exam.cond_diabetes = opt(row, "cond_diabetes");

    Some(exam)
}

fn alert_from_row(row: &SqliteRow) -> Option<Alert> {
    let payload: String = row.try_get("payload").ok()?;
    let created_at: String = row.try_get("created_at").ok()?;
    let resolved_at: Option<String> = row.try_get("resolved_at").ok()?;

    Some(Alert {
        id: row.try_get("id").ok()?,
        alert_type: row.try_get::<String, _>("alert_type").ok()?.parse().ok()?,
        urgency: row.try_get::<String, _>("urgency").ok()?.parse().ok()?,
        title: row.try_get("title").ok()?,
        message: row.try_get("message").ok()?,
        patient_id: row.try_get("patient_id").ok()?,
        exam_id: row.try_get("exam_id").ok()?,
        rule_key: row.try_get("rule_key").ok()?,
        status: row.try_get::<String, _>("status").ok()?.parse().ok()?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        created_at: parse_timestamp(&created_at)?,
        resolved_at: resolved_at.as_deref().and_then(parse_timestamp),
        resolved_by: row.try_get("resolved_by").ok()?,
    })
}

/// Build the `WHERE` clause for an alert filter. SQLite has no optional
/// binds, so conditions are appended to a `1=1` base in bind order.
fn alert_conditions(filter: &AlertFilter) -> (String, Vec<ColumnValue>) {
    let mut conditions = vec!["1=1"];
    let mut binds = Vec::new();

    if let Some(alert_type) = filter.alert_type {
        conditions.push("alert_type = ?");
        binds.push(ColumnValue::Text(Some(alert_type.as_str().to_string())));
    }
    if let Some(urgency) = filter.urgency {
        conditions.push("urgency = ?");
        binds.push(ColumnValue::Text(Some(urgency.as_str().to_string())));
    }
    if let Some(status) = filter.status {
        conditions.push("status = ?");
        binds.push(ColumnValue::Text(Some(status.as_str().to_string())));
    }
    if let Some(patient_id) = filter.patient_id {
        conditions.push("patient_id = ?");
        binds.push(ColumnValue::Int(Some(patient_id)));
    }

    (conditions.join(" AND "), binds)
}

#[async_trait]
impl ExamStore for ClinicalRepository {
    async fn upsert_exam(&self, exam: &Exam, tier: FieldTier) -> Result<UpsertOutcome, StoreError> {
        let columns = exam_columns(exam, tier);

        let known = self.known_exam_columns().await?;
        if let Some((missing, _)) = columns.iter().find(|(name, _)| !known.contains(*name)) {
            return Err(StoreError::UnknownColumn { field: missing.to_string() });
        }

        let hash = content_hash(&columns);
        let now = format_timestamp(Utc::now());

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id, patient_id, content_hash FROM exams WHERE external_id = ?")
            .bind(&exam.external_id)
            .fetch_optional(&mut *tx)
            .await?;

        let patient_id: Option<i64> = match &exam.patient_external_id {
            Some(external) => sqlx::query("SELECT id FROM patients WHERE external_id = ?")
                .bind(external)
                .fetch_optional(&mut *tx)
                .await?
                .and_then(|row| row.try_get("id").ok()),
            None => None,
        };

        let outcome = match existing {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let stored_patient: Option<i64> = row.try_get("patient_id")?;
                let stored_hash: Option<String> = row.try_get("content_hash")?;
                if stored_hash.as_deref() == Some(hash.as_str()) && stored_patient == patient_id {
                    return Ok(UpsertOutcome::Unchanged { id });
                }

                let assignments: Vec<String> =
                    columns.iter().map(|(name, _)| format!("{} = ?", name)).collect();
                let sql = format!(
                    "UPDATE exams SET {}, patient_id = ?, content_hash = ?, updated_at = ? WHERE id = ?",
                    assignments.join(", ")
                );

                let mut query = sqlx::query(&sql);
                for (_, value) in columns {
                    query = bind_value(query, value);
                }
                query
                    .bind(patient_id)
                    .bind(&hash)
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;

                UpsertOutcome::Updated { id }
            }
            None => {
                let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
                let placeholders = vec!["?"; names.len() + 4].join(", ");
                let sql = format!(
                    "INSERT INTO exams ({}, patient_id, content_hash, created_at, updated_at) VALUES ({})",
                    names.join(", "),
                    placeholders
                );

                let mut query = sqlx::query(&sql);
                for (_, value) in columns {
                    query = bind_value(query, value);
                }
                let result = query
                    .bind(patient_id)
                    .bind(&hash)
                    .bind(&now)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;

                UpsertOutcome::Created { id: result.last_insert_rowid() }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_exam(&self, id: i64) -> Result<Option<Exam>, StoreError> {
        let row = sqlx::query("SELECT * FROM exams WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().and_then(exam_from_row))
    }

    async fn get_exam_by_external_id(&self, external_id: &str) -> Result<Option<Exam>, StoreError> {
        let row = sqlx::query("SELECT * FROM exams WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().and_then(exam_from_row))
    }

    async fn previous_exam(&self, exam: &Exam) -> Result<Option<Exam>, StoreError> {
        // Exams of a patient not registered locally yet still share the
        // partner's patient reference.
        let query = match (exam.patient_id, exam.patient_external_id.as_deref()) {
            (Some(patient_id), _) => sqlx::query(
                "SELECT * FROM exams
                 WHERE patient_id = ? AND exam_type = ? AND exam_date < ? AND external_id <> ?
                 ORDER BY exam_date DESC
                 LIMIT 1",
            )
            .bind(patient_id),
            (None, Some(patient_ref)) => sqlx::query(
                "SELECT * FROM exams
                 WHERE patient_external_id = ? AND exam_type = ? AND exam_date < ? AND external_id <> ?
                 ORDER BY exam_date DESC
                 LIMIT 1",
            )
            .bind(patient_ref),
            (None, None) => return Ok(None),
        };

        let row = query
            .bind(exam.exam_type.as_str())
            .bind(format_timestamp(exam.exam_date))
            .bind(&exam.external_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().and_then(exam_from_row))
    }

    async fn patient_exams(&self, patient_id: i64) -> Result<Vec<Exam>, StoreError> {
        let rows = sqlx::query("SELECT * FROM exams WHERE patient_id = ? ORDER BY exam_date ASC, id ASC")
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(exam_from_row).collect())
    }

    async fn get_patient(&self, id: i64) -> Result<Option<Patient>, StoreError> {
        let row = sqlx::query(
            "SELECT id, external_id, name, weight_kg, height_cm, therapy_sessions_used, therapy_sessions_prescribed
             FROM patients WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(Patient {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            weight_kg: row.try_get("weight_kg")?,
            height_cm: row.try_get("height_cm")?,
            therapy_sessions_used: row.try_get("therapy_sessions_used")?,
            therapy_sessions_prescribed: row.try_get("therapy_sessions_prescribed")?,
        }))
    }
}

#[async_trait]
impl AlertStore for ClinicalRepository {
    async fn create_alert_if_absent(
        &self,
        alert: &NewAlert,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StoreError> {
        let payload = serde_json::to_string(&alert.payload)
            .map_err(|e| StoreError::Integrity { message: e.to_string() })?;

        // The partial unique index turns a duplicate pending alert into a no-op.
        let result = sqlx::query(
            "INSERT INTO alerts
             (alert_type, urgency, title, message, patient_id, exam_id, rule_key, status, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(alert.alert_type.as_str())
        .bind(alert.urgency.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.patient_id)
        .bind(alert.exam_id)
        .bind(&alert.rule_key)
        .bind(&payload)
        .bind(format_timestamp(created_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_alert(result.last_insert_rowid()).await
    }

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>, StoreError> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => alert_from_row(&row).map(Some).ok_or_else(|| StoreError::Integrity {
                message: format!("Alert {} could not be decoded", id),
            }),
            None => Ok(None),
        }
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError> {
        let limit = filter.limit.unwrap_or(50).clamp(1, MAX_ALERT_PAGE);
        let (conditions, binds) = alert_conditions(filter);
        let sql = format!(
            "SELECT * FROM alerts WHERE {} ORDER BY created_at DESC, id DESC LIMIT ?",
            conditions
        );

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        Ok(rows.iter().filter_map(alert_from_row).collect())
    }

    async fn count_alerts(&self, filter: &AlertFilter) -> Result<i64, StoreError> {
        let (conditions, binds) = alert_conditions(filter);
        let sql = format!("SELECT COUNT(*) AS cnt FROM alerts WHERE {}", conditions);

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get("cnt")?)
    }

    async fn transition_alert(
        &self,
        id: i64,
        expected: Option<AlertStatus>,
        to: AlertStatus,
        at: DateTime<Utc>,
        by: Option<&str>,
    ) -> Result<bool, StoreError> {
        let resolved_at = to.is_closed().then(|| format_timestamp(at));
        let resolved_by = if to.is_closed() { by } else { None };

        let result = match expected {
            Some(current) => {
                sqlx::query(
                    "UPDATE alerts SET status = ?, resolved_at = ?, resolved_by = ?
                     WHERE id = ? AND status = ?",
                )
                .bind(to.as_str())
                .bind(resolved_at)
                .bind(resolved_by)
                .bind(id)
                .bind(current.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE alerts SET status = ?, resolved_at = ?, resolved_by = ? WHERE id = ?")
                    .bind(to.as_str())
                    .bind(resolved_at)
                    .bind(resolved_by)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM alerts WHERE status = 'resolved' AND resolved_at IS NOT NULL AND resolved_at < ?",
        )
        .bind(format_timestamp(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::alerts::types::{AlertType, AlertUrgency};
    use crate::clinical::ExamType;
    use crate::db::{create_pool, create_pool_with_schema, SchemaLevel};

    async fn make_repo() -> ClinicalRepository {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        ClinicalRepository::new(pool)
    }

    fn make_exam(external_id: &str, days_ago: i64, ido: f64) -> Exam {
        let mut exam = Exam::new(external_id, ExamType::Sleep, Utc::now() - Duration::days(days_ago));
        exam.patient_external_id = Some("p-1".into());
        exam.apnea_index = Some(ido);
        exam.spo2_min = Some(86.0);
        exam.hr_min = Some(52.0);
        exam
    }

    fn make_alert(rule_key: &str, exam_id: Option<i64>) -> NewAlert {
        NewAlert {
            alert_type: AlertType::Critical,
            urgency: AlertUrgency::High,
            title: "Severe apnea".into(),
            message: "IDO 42".into(),
            patient_id: Some(1),
            exam_id,
            rule_key: rule_key.into(),
            payload: serde_json::json!({ "apnea_index": 42.0 }),
        }
    }

    async fn seed_patient(repo: &ClinicalRepository) -> i64 {
        repo.insert_patient(&NewPatient {
            external_id: Some("p-1".into()),
            name: "Ana".into(),
            weight_kg: Some(70.0),
            height_cm: Some(175.0),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    // ---- exams ----

    #[tokio::test]
    async fn upsert_creates_then_updates_same_row() {
        let repo = make_repo().await;

        let first = repo.upsert_exam(&make_exam("ext-1", 1, 20.0), FieldTier::Extended).await.unwrap();
        assert!(matches!(first, UpsertOutcome::Created { .. }));

        let second = repo.upsert_exam(&make_exam("ext-1", 1, 25.0), FieldTier::Extended).await.unwrap();
        assert_eq!(second, UpsertOutcome::Updated { id: first.id() });

        let count: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM exams")
            .fetch_one(repo.pool())
            .await
            .unwrap()
            .get("cnt");
        assert_eq!(count, 1);

        let stored = repo.get_exam_by_external_id("ext-1").await.unwrap().unwrap();
        assert_eq!(stored.apnea_index, Some(25.0));
        assert_eq!(stored.hr_min, Some(52.0));
    }

    #[tokio::test]
    async fn upsert_with_same_content_is_unchanged() {
        let repo = make_repo().await;
        let exam = make_exam("ext-1", 1, 20.0);

        let created = repo.upsert_exam(&exam, FieldTier::Extended).await.unwrap();
        let again = repo.upsert_exam(&exam, FieldTier::Extended).await.unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged { id: created.id() });
    }

    #[tokio::test]
    async fn upsert_links_known_patient() {
        let repo = make_repo().await;
        let patient_id = seed_patient(&repo).await;

        let outcome = repo.upsert_exam(&make_exam("ext-1", 1, 20.0), FieldTier::Basic).await.unwrap();
        let stored = repo.get_exam(outcome.id()).await.unwrap().unwrap();
        assert_eq!(stored.patient_id, Some(patient_id));
    }

    #[tokio::test]
    async fn extended_write_on_basic_schema_reports_unknown_column() {
        let pool = create_pool_with_schema("sqlite::memory:", SchemaLevel::Basic).await.unwrap();
        let repo = ClinicalRepository::new(pool);

        let err = repo
            .upsert_exam(&make_exam("ext-1", 1, 20.0), FieldTier::Extended)
            .await
            .unwrap_err();
        match err {
            StoreError::UnknownColumn { field } => assert!(crate::schema::is_extended_field(&field)),
            other => panic!("expected UnknownColumn, got {:?}", other),
        }

        // Nothing half-written.
        assert!(repo.get_exam_by_external_id("ext-1").await.unwrap().is_none());

        let basic = repo.upsert_exam(&make_exam("ext-1", 1, 20.0), FieldTier::Basic).await.unwrap();
        let stored = repo.get_exam(basic.id()).await.unwrap().unwrap();
        assert_eq!(stored.apnea_index, Some(20.0));
        assert_eq!(stored.hr_min, None);
    }

    #[tokio::test]
    async fn previous_exam_is_latest_earlier_exam_of_same_type() {
        let repo = make_repo().await;
        seed_patient(&repo).await;

        repo.upsert_exam(&make_exam("old", 60, 10.0), FieldTier::Extended).await.unwrap();
        repo.upsert_exam(&make_exam("mid", 30, 15.0), FieldTier::Extended).await.unwrap();
        let mut snoring = make_exam("snore", 10, 0.0);
        snoring.exam_type = ExamType::Snoring;
        repo.upsert_exam(&snoring, FieldTier::Extended).await.unwrap();
        let latest = repo.upsert_exam(&make_exam("new", 1, 30.0), FieldTier::Extended).await.unwrap();

        let latest = repo.get_exam(latest.id()).await.unwrap().unwrap();
        let previous = repo.previous_exam(&latest).await.unwrap().unwrap();
        assert_eq!(previous.external_id, "mid");

        let history = repo.patient_exams(latest.patient_id.unwrap()).await.unwrap();
        let ids: Vec<_> = history.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "mid", "snore", "new"]);
    }

    #[tokio::test]
    async fn previous_exam_falls_back_to_partner_patient_reference() {
        let repo = make_repo().await;

        repo.upsert_exam(&make_exam("old", 30, 10.0), FieldTier::Extended).await.unwrap();
        let latest = repo.upsert_exam(&make_exam("new", 1, 30.0), FieldTier::Extended).await.unwrap();

        let latest = repo.get_exam(latest.id()).await.unwrap().unwrap();
        assert_eq!(latest.patient_id, None);
        let previous = repo.previous_exam(&latest).await.unwrap().unwrap();
        assert_eq!(previous.external_id, "old");

        let mut orphan = make_exam("orphan", 0, 5.0);
        orphan.patient_external_id = None;
        assert!(repo.previous_exam(&orphan).await.unwrap().is_none());
    }

    // ---- alerts ----

    #[tokio::test]
    async fn duplicate_pending_alert_is_not_created() {
        let repo = make_repo().await;
        let now = Utc::now();

        let first = repo.create_alert_if_absent(&make_alert("severe_apnea", Some(7)), now).await.unwrap();
        assert!(first.is_some());
        let second = repo.create_alert_if_absent(&make_alert("severe_apnea", Some(7)), now).await.unwrap();
        assert!(second.is_none());

        // Different exam or rule is a different alert.
        assert!(repo.create_alert_if_absent(&make_alert("severe_apnea", Some(8)), now).await.unwrap().is_some());
        assert!(repo.create_alert_if_absent(&make_alert("critical_desaturation", Some(7)), now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn patient_level_alerts_deduplicate_without_exam() {
        let repo = make_repo().await;
        let now = Utc::now();
        assert!(repo.create_alert_if_absent(&make_alert("low_therapy_adherence", None), now).await.unwrap().is_some());
        assert!(repo.create_alert_if_absent(&make_alert("low_therapy_adherence", None), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolved_alert_frees_the_dedup_slot() {
        let repo = make_repo().await;
        let now = Utc::now();
        let alert = repo.create_alert_if_absent(&make_alert("severe_apnea", Some(7)), now).await.unwrap().unwrap();

        let moved = repo
            .transition_alert(alert.id, Some(AlertStatus::Pending), AlertStatus::Resolved, now, Some("dr.lee"))
            .await
            .unwrap();
        assert!(moved);

        let stored = repo.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Resolved);
        assert!(stored.resolved_at.is_some());
        assert_eq!(stored.resolved_by.as_deref(), Some("dr.lee"));

        assert!(repo.create_alert_if_absent(&make_alert("severe_apnea", Some(7)), now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn guarded_transition_fails_when_status_moved() {
        let repo = make_repo().await;
        let now = Utc::now();
        let alert = repo.create_alert_if_absent(&make_alert("severe_apnea", Some(7)), now).await.unwrap().unwrap();

        repo.transition_alert(alert.id, Some(AlertStatus::Pending), AlertStatus::Ignored, now, None)
            .await
            .unwrap();
        let moved = repo
            .transition_alert(alert.id, Some(AlertStatus::Pending), AlertStatus::Resolved, now, None)
            .await
            .unwrap();
        assert!(!moved);
    }

    #[tokio::test]
    async fn delete_resolved_before_only_removes_old_resolved() {
        let repo = make_repo().await;
        let now = Utc::now();

        let old = repo.create_alert_if_absent(&make_alert("a", Some(1)), now).await.unwrap().unwrap();
        let recent = repo.create_alert_if_absent(&make_alert("b", Some(1)), now).await.unwrap().unwrap();
        let ignored = repo.create_alert_if_absent(&make_alert("c", Some(1)), now).await.unwrap().unwrap();
        let pending = repo.create_alert_if_absent(&make_alert("d", Some(1)), now).await.unwrap().unwrap();

        repo.transition_alert(old.id, None, AlertStatus::Resolved, now - Duration::days(4), None).await.unwrap();
        repo.transition_alert(recent.id, None, AlertStatus::Resolved, now - Duration::days(2), None).await.unwrap();
        repo.transition_alert(ignored.id, None, AlertStatus::Ignored, now - Duration::days(10), None).await.unwrap();

        let deleted = repo.delete_resolved_before(now - Duration::days(3)).await.unwrap();
        assert_eq!(deleted, 1);

        assert!(repo.get_alert(old.id).await.unwrap().is_none());
        assert!(repo.get_alert(recent.id).await.unwrap().is_some());
        assert!(repo.get_alert(ignored.id).await.unwrap().is_some());
        assert!(repo.get_alert(pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_and_count_apply_filters() {
        let repo = make_repo().await;
        let now = Utc::now();

        repo.create_alert_if_absent(&make_alert("a", Some(1)), now).await.unwrap();
        let mut follow_up = make_alert("b", Some(1));
        follow_up.alert_type = AlertType::FollowUp;
        follow_up.urgency = AlertUrgency::Low;
        repo.create_alert_if_absent(&follow_up, now).await.unwrap();

        let filter = AlertFilter {
            alert_type: Some(AlertType::FollowUp),
            ..Default::default()
        };
        let items = repo.list_alerts(&filter).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].urgency, AlertUrgency::Low);
        assert_eq!(items[0].payload["apnea_index"], 42.0);

        assert_eq!(repo.count_alerts(&AlertFilter::default()).await.unwrap(), 2);
        let pending = AlertFilter {
            status: Some(AlertStatus::Pending),
            urgency: Some(AlertUrgency::High),
            ..Default::default()
        };
        assert_eq!(repo.count_alerts(&pending).await.unwrap(), 1);
    }
}
