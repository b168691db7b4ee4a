//! Exam column tiers.
//!
//! The *basic* tier is guaranteed to exist in every deployed schema. The
//! *extended* tier holds newer fields that only exist once the extended
//! migration has been applied. Writers must always be able to fall back to
//! the basic projection on its own.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clinical::Exam;

/// Which set of exam columns a write touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTier {
    Basic,
    Extended,
}

/// Field-name prefixes introduced by the extended migration.
///
/// A store error naming a field with one of these prefixes means the
/// migration is pending and the write can be retried with the basic tier.
pub const EXTENDED_FIELD_PREFIXES: &[&str] = &[
    "snore_", "hr_", "hypoxic_", "desat_", "time_", "duration_", "sleep_", "af_", "cond_",
];

/// Extended columns and their SQLite types, in migration order.
pub const EXTENDED_COLUMNS: &[(&str, &str)] = &[
    ("snore_low_pct", "REAL"),
    ("snore_medium_pct", "REAL"),
    ("snore_high_pct", "REAL"),
    ("hr_min", "REAL"),
    ("hr_avg", "REAL"),
    ("hr_max", "REAL"),
    ("hypoxic_burden", "REAL"),
    ("desat_count", "INTEGER"),
    ("time_below_90_s", "REAL"),
    ("duration_s", "REAL"),
    ("sleep_efficiency", "REAL"),
    ("sleep_start", "TEXT"),
    ("sleep_end", "TEXT"),
    ("af_detected", "INTEGER"),
    ("cond_hypertension", "INTEGER"),
    ("cond_diabetes", "INTEGER"),
];

/// `true` when `field` belongs to the extended tier.
pub fn is_extended_field(field: &str) -> bool {
    EXTENDED_FIELD_PREFIXES
        .iter()
        .any(|prefix| field.starts_with(prefix))
}

/// Canonical timestamp encoding for the store: RFC 3339, UTC, microseconds.
/// Fixed width so string comparison in SQL orders correctly.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A typed, nullable column value ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(Option<String>),
    Real(Option<f64>),
    Int(Option<i64>),
    Bool(Option<bool>),
}

impl ColumnValue {
    fn fingerprint(&self) -> String {
        match self {
            ColumnValue::Text(v) => format!("{:?}", v),
            ColumnValue::Real(v) => format!("{:?}", v),
            ColumnValue::Int(v) => format!("{:?}", v),
            ColumnValue::Bool(v) => format!("{:?}", v),
        }
    }
}

/// Project an exam onto the columns of `tier`. The extended projection is
/// a superset of the basic one.
pub fn exam_columns(exam: &Exam, tier: FieldTier) -> Vec<(&'static str, ColumnValue)> {
    use ColumnValue::*;

    let mut columns = vec![
        ("external_id", Text(Some(exam.external_id.clone()))),
        ("exam_key", Text(exam.exam_key.clone())),
        ("patient_external_id", Text(exam.patient_external_id.clone())),
        ("exam_type", Text(Some(exam.exam_type.as_str().to_string()))),
        ("status", Text(Some(exam.status.clone()))),
        ("exam_date", Text(Some(format_timestamp(exam.exam_date)))),
        ("weight_kg", Real(exam.weight_kg)),
        ("height_cm", Real(exam.height_cm)),
        ("bmi", Real(exam.bmi)),
        ("apnea_index", Real(exam.apnea_index)),
        ("apnea_category", Text(exam.apnea_category.clone())),
        ("spo2_min", Real(exam.spo2_min)),
        ("spo2_avg", Real(exam.spo2_avg)),
        ("spo2_max", Real(exam.spo2_max)),
        ("snoring_score", Real(exam.snoring_score)),
    ];

    if tier == FieldTier::Extended {
        columns.extend([
            ("snore_low_pct", Real(exam.snore_low_pct)),
            ("snore_medium_pct", Real(exam.snore_medium_pct)),
            ("snore_high_pct", Real(exam.snore_high_pct)),
            ("hr_min", Real(exam.hr_min)),
            ("hr_avg", Real(exam.hr_avg)),
            ("hr_max", Real(exam.hr_max)),
            ("hypoxic_burden", Real(exam.hypoxic_burden)),
            ("desat_count", Int(exam.desat_count)),
            ("time_below_90_s", Real(exam.time_below_90_s)),
            ("duration_s", Real(exam.duration_s)),
            ("sleep_efficiency", Real(exam.sleep_efficiency)),
            ("sleep_start", Text(exam.sleep_start.map(format_timestamp))),
            ("sleep_end", Text(exam.sleep_end.map(format_timestamp))),
            ("af_detected", Bool(exam.af_detected)),
            ("cond_hypertension", Bool(exam.cond_hypertension)),
            ("cond_diabetes", Bool(exam.cond_diabetes)),
        ]);
    }

    columns
}

/// Stable fingerprint of a projection, used to skip writes that would not
/// change the stored row.
///
/// Persisted alongside the row, so the digest must not depend on the
/// toolchain: SHA-256 over NUL-separated `name`/`value` pairs.
pub fn content_hash(columns: &[(&'static str, ColumnValue)]) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in columns {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.fingerprint().as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
