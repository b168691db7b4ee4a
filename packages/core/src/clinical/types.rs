//! Core data types for patients and diagnostic exams

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::clinical::indices::{adherence_percentage, adiposity_index};

/// Kind of diagnostic session delivered by the partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    /// Overnight oximetry / polysomnography.
    Sleep,
    Snoring,
}

impl ExamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamType::Sleep => "sleep",
            ExamType::Snoring => "snoring",
        }
    }
}

impl fmt::Display for ExamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExamType {
    type Err = String;

    /// Accepts both the local spelling and the partner's upper-case codes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sleep" | "polysomnography" => Ok(ExamType::Sleep),
            "snoring" => Ok(ExamType::Snoring),
            other => Err(format!("Unknown exam type '{}'", other)),
        }
    }
}

/// A patient as maintained by clinical staff. The core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub external_id: Option<String>,
    pub name: String,
    pub weight_kg: Option<f64>,
    pub height_cm: Option<f64>,
    pub therapy_sessions_used: Option<i64>,
    pub therapy_sessions_prescribed: Option<i64>,
}

impl Patient {
    pub fn adiposity_index(&self) -> Option<f64> {
        adiposity_index(self.weight_kg, self.height_cm)
    }

    pub fn adherence_percentage(&self) -> Option<f64> {
        adherence_percentage(self.therapy_sessions_used, self.therapy_sessions_prescribed)
    }
}

/// Intake payload used by the patient registry when creating a patient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPatient {
    pub external_id: Option<String>,
    pub name: String,
    pub weight_kg: Option<f64>,
    pub height_cm: Option<f64>,
    pub therapy_sessions_used: Option<i64>,
    pub therapy_sessions_prescribed: Option<i64>,
}

/// One diagnostic session in canonical (local) form.
///
/// `id` and `patient_id` are `None` until the record store has persisted
/// the exam and resolved the partner patient reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exam {
    pub id: Option<i64>,
    pub external_id: String,
    pub exam_key: Option<String>,
    pub patient_id: Option<i64>,
    pub patient_external_id: Option<String>,
    pub exam_type: ExamType,
    pub status: String,
    pub exam_date: DateTime<Utc>,

    // Basic tier
    pub weight_kg: Option<f64>,
    pub height_cm: Option<f64>,
    pub bmi: Option<f64>,
    pub apnea_index: Option<f64>,
    pub apnea_category: Option<String>,
    pub spo2_min: Option<f64>,
    pub spo2_avg: Option<f64>,
    pub spo2_max: Option<f64>,
    pub snoring_score: Option<f64>,

    // Extended tier
    pub snore_low_pct: Option<f64>,
    pub snore_medium_pct: Option<f64>,
    pub snore_high_pct: Option<f64>,
    pub hr_min: Option<f64>,
    pub hr_avg: Option<f64>,
    pub hr_max: Option<f64>,
    pub hypoxic_burden: Option<f64>,
    pub desat_count: Option<i64>,
    pub time_below_90_s: Option<f64>,
    pub duration_s: Option<f64>,
    pub sleep_efficiency: Option<f64>,
    pub sleep_start: Option<DateTime<Utc>>,
    pub sleep_end: Option<DateTime<Utc>>,
    pub af_detected: Option<bool>,
    pub cond_hypertension: Option<bool>,
    pub cond_diabetes: Option<bool>,
}

impl Exam {
    /// A bare exam with every measurement unset.
    pub fn new(external_id: impl Into<String>, exam_type: ExamType, exam_date: DateTime<Utc>) -> Self {
        Self {
            id: None,
            external_id: external_id.into(),
            exam_key: None,
            patient_id: None,
            patient_external_id: None,
            exam_type,
            status: "done".to_string(),
            exam_date,
            weight_kg: None,
            height_cm: None,
            bmi: None,
            apnea_index: None,
            apnea_category: None,
            spo2_min: None,
            spo2_avg: None,
            spo2_max: None,
            snoring_score: None,
            snore_low_pct: None,
            snore_medium_pct: None,
            snore_high_pct: None,
            hr_min: None,
            hr_avg: None,
            hr_max: None,
            hypoxic_burden: None,
            desat_count: None,
            time_below_90_s: None,
            duration_s: None,
            sleep_efficiency: None,
            sleep_start: None,
            sleep_end: None,
            af_detected: None,
            cond_hypertension: None,
            cond_diabetes: None,
        }
    }

    pub fn is_sleep(&self) -> bool {
        self.exam_type == ExamType::Sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exam_type_parses_partner_codes() {
        assert_eq!("SLEEP".parse::<ExamType>().unwrap(), ExamType::Sleep);
        assert_eq!("Polysomnography".parse::<ExamType>().unwrap(), ExamType::Sleep);
        assert_eq!(" snoring ".parse::<ExamType>().unwrap(), ExamType::Snoring);
        assert!("CARDIO".parse::<ExamType>().is_err());
    }

    #[test]
    fn patient_derives_indices_from_raw_fields() {
        let patient = Patient {
            id: 1,
            external_id: None,
            name: "Ana".into(),
            weight_kg: Some(70.0),
            height_cm: Some(175.0),
            therapy_sessions_used: Some(15),
            therapy_sessions_prescribed: Some(10),
        };
        assert_eq!(patient.adiposity_index(), Some(22.86));
        assert_eq!(patient.adherence_percentage(), Some(150.0));
    }
}
