//! Partner exam → canonical [`Exam`] mapping.
//!
//! The partner payload is decoded leniently: unknown fields are ignored,
//! missing optional sections become nulls and numbers may arrive either as
//! JSON numbers or as numeric strings. Derived metrics (adiposity index,
//! snoring score) are computed here, at sync time, from the raw fields.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::clinical::{adiposity_index, snoring_score, Exam, ExamType};
use crate::sync::error::SyncError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LenientNumber {
    Number(f64),
    Text(String),
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<LenientNumber>::deserialize(deserializer)?;
    Ok(match raw {
        Some(LenientNumber::Number(n)) => Some(n),
        Some(LenientNumber::Text(s)) => s.trim().replace(',', ".").parse().ok(),
        None => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerExam {
    #[serde(deserialize_with = "lenient_string", default)]
    exam_id: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(rename = "type", default)]
    exam_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    exam_date: Option<String>,
    #[serde(default)]
    patient: Option<PartnerPatient>,
    #[serde(default)]
    result: Option<PartnerResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerPatient {
    #[serde(deserialize_with = "lenient_string", default)]
    patient_id: Option<String>,
    #[serde(deserialize_with = "lenient_f64", default)]
    weight_kg: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    height_cm: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerResult {
    #[serde(default)]
    oximetry: Option<PartnerOximetry>,
    #[serde(default)]
    snoring: Option<PartnerSnoring>,
    #[serde(default)]
    heart_rate: Option<PartnerHeartRate>,
    #[serde(default)]
    sleep: Option<PartnerSleep>,
    #[serde(default)]
    conditions: Option<PartnerConditions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerOximetry {
    #[serde(deserialize_with = "lenient_f64", default)]
    ido: Option<f64>,
    #[serde(default)]
    ido_category: Option<String>,
    #[serde(deserialize_with = "lenient_f64", default)]
    spo2_min: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    spo2_avg: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    spo2_max: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    hypoxic_burden: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    desaturation_count: Option<f64>,
    #[serde(rename = "timeBelow90Seconds", deserialize_with = "lenient_f64", default)]
    time_below_90_seconds: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    duration_seconds: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerSnoring {
    #[serde(deserialize_with = "lenient_f64", default)]
    low_percent: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    medium_percent: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    high_percent: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartnerHeartRate {
    #[serde(deserialize_with = "lenient_f64", default)]
    min: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    avg: Option<f64>,
    #[serde(deserialize_with = "lenient_f64", default)]
    max: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartnerSleep {
    #[serde(deserialize_with = "lenient_f64", default)]
    efficiency: Option<f64>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerConditions {
    #[serde(default)]
    atrial_fibrillation: Option<bool>,
    #[serde(default)]
    hypertension: Option<bool>,
    #[serde(default)]
    diabetes: Option<bool>,
}

/// Parse the partner's date formats: RFC 3339, `YYYY-MM-DD HH:MM:SS`
/// (taken as UTC) or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_partner_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Best-effort identifier of a raw exam, for error reports.
pub fn raw_external_id(raw: &Value) -> Option<String> {
    match raw.get("examId")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map one raw partner exam to the canonical exam.
///
/// Identifier, type and date are mandatory; anything else may be missing.
/// Failures are data-integrity errors for this record only.
pub fn map_partner_exam(raw: &Value) -> Result<Exam, SyncError> {
    let partner: PartnerExam = serde_json::from_value(raw.clone())
        .map_err(|e| SyncError::data_integrity(format!("Undecodable exam: {}", e)))?;

    let external_id = partner
        .exam_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| SyncError::data_integrity("Exam has no examId"))?;

    let exam_type: ExamType = partner
        .exam_type
        .as_deref()
        .ok_or_else(|| SyncError::data_integrity(format!("Exam {} has no type", external_id)))?
        .parse()
        .map_err(|e| SyncError::data_integrity(format!("Exam {}: {}", external_id, e)))?;

    let exam_date = partner
        .exam_date
        .as_deref()
        .and_then(parse_partner_date)
        .ok_or_else(|| SyncError::data_integrity(format!("Exam {} has no valid examDate", external_id)))?;

    let patient = partner.patient.unwrap_or_default();
    let result = partner.result.unwrap_or_default();
    let oximetry = result.oximetry.unwrap_or_default();
    let snoring = result.snoring.unwrap_or_default();
    let heart_rate = result.heart_rate.unwrap_or_default();
    let sleep = result.sleep.unwrap_or_default();
    let conditions = result.conditions.unwrap_or_default();

    let mut exam = Exam::new(external_id, exam_type, exam_date);
    exam.exam_key = partner.key;
    exam.patient_external_id = patient.patient_id;
    exam.status = partner
        .status
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    exam.weight_kg = patient.weight_kg;
    exam.height_cm = patient.height_cm;
    exam.bmi = adiposity_index(patient.weight_kg, patient.height_cm);

    exam.apnea_index = oximetry.ido;
    exam.apnea_category = oximetry.ido_category;
    exam.spo2_min = oximetry.spo2_min;
    exam.spo2_avg = oximetry.spo2_avg;
    exam.spo2_max = oximetry.spo2_max;
    exam.hypoxic_burden = oximetry.hypoxic_burden;
    exam.desat_count = oximetry.desaturation_count.map(|n| n.round() as i64);
    exam.time_below_90_s = oximetry.time_below_90_seconds;
    exam.duration_s = oximetry.duration_seconds;

    exam.snore_low_pct = snoring.low_percent;
    exam.snore_medium_pct = snoring.medium_percent;
    exam.snore_high_pct = snoring.high_percent;
    exam.snoring_score = snoring_score(snoring.low_percent, snoring.medium_percent, snoring.high_percent);

    exam.hr_min = heart_rate.min;
    exam.hr_avg = heart_rate.avg;
    exam.hr_max = heart_rate.max;

    exam.sleep_efficiency = sleep.efficiency;
    exam.sleep_start = sleep.start.as_deref().and_then(parse_partner_date);
    exam.sleep_end = sleep.end.as_deref().and_then(parse_partner_date);

    exam.af_detected = conditions.atrial_fibrillation;
    exam.cond_hypertension = conditions.hypertension;
    exam.cond_diabetes = conditions.diabetes;

    Ok(exam)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn full_exam() -> Value {
        json!({
            "examId": "B-1001",
            "key": "K9X2",
            "type": "SLEEP",
            "status": "DONE",
            "examDate": "2024-03-01T22:10:00Z",
            "patient": { "patientId": 77, "weightKg": "70", "heightCm": 175 },
            "result": {
                "oximetry": {
                    "ido": 31.4, "idoCategory": "severe",
                    "spo2Min": 79, "spo2Avg": "93,5", "spo2Max": 98,
                    "hypoxicBurden": 41.2, "desaturationCount": 212,
                    "timeBelow90Seconds": 1800, "durationSeconds": 25200
                },
                "snoring": { "lowPercent": 20, "mediumPercent": 10, "highPercent": 5 },
                "heartRate": { "min": 48, "avg": 61, "max": 102 },
                "sleep": { "efficiency": 82.5, "start": "2024-03-01T23:00:00Z", "end": "2024-03-02T06:00:00Z" },
                "conditions": { "atrialFibrillation": true, "hypertension": false }
            },
            "partnerInternalScore": 0.77
        })
    }

    #[test]
    fn maps_full_payload_and_derives_metrics() {
        let exam = map_partner_exam(&full_exam()).unwrap();

        assert_eq!(exam.external_id, "B-1001");
        assert_eq!(exam.exam_key.as_deref(), Some("K9X2"));
        assert_eq!(exam.patient_external_id.as_deref(), Some("77"));
        assert_eq!(exam.exam_type, ExamType::Sleep);
        assert_eq!(exam.status, "done");
        assert_eq!(exam.exam_date, Utc.with_ymd_and_hms(2024, 3, 1, 22, 10, 0).unwrap());
        assert_eq!(exam.bmi, Some(22.86));
        assert_eq!(exam.spo2_avg, Some(93.5));
        assert_eq!(exam.desat_count, Some(212));
        assert_eq!(exam.snoring_score, Some(18.33));
        assert_eq!(exam.af_detected, Some(true));
        assert_eq!(exam.cond_diabetes, None);
        assert!(exam.sleep_end.is_some());
    }

    #[test]
    fn minimal_payload_maps_with_empty_measurements() {
        let exam = map_partner_exam(&json!({
            "examId": "B-2",
            "type": "snoring",
            "status": "PENDING",
            "examDate": "2024-02-10"
        }))
        .unwrap();

        assert_eq!(exam.exam_type, ExamType::Snoring);
        assert_eq!(exam.exam_date, Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap());
        assert_eq!(exam.bmi, None);
        assert_eq!(exam.snoring_score, None);
        assert_eq!(exam.hr_min, None);
    }

    #[test]
    fn missing_identifier_is_data_integrity_error() {
        let err = map_partner_exam(&json!({ "type": "SLEEP", "examDate": "2024-01-01" })).unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity { .. }));
    }

    #[test]
    fn unknown_exam_type_is_rejected() {
        let err = map_partner_exam(&json!({
            "examId": "B-3", "type": "CARDIO", "examDate": "2024-01-01"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("B-3"));
    }

    #[test]
    fn invalid_date_is_rejected() {
        let err = map_partner_exam(&json!({
            "examId": "B-4", "type": "SLEEP", "examDate": "yesterday"
        }))
        .unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity { .. }));
    }

    #[test]
    fn parses_partner_date_formats() {
        assert!(parse_partner_date("2024-03-01T22:10:00-03:00").is_some());
        assert_eq!(
            parse_partner_date("2024-03-01 22:10:00"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 22, 10, 0).unwrap())
        );
        assert!(parse_partner_date("01/03/2024").is_none());
    }

    #[test]
    fn raw_external_id_reads_numbers_and_strings() {
        assert_eq!(raw_external_id(&json!({ "examId": 12 })), Some("12".into()));
        assert_eq!(raw_external_id(&json!({ "examId": "x" })), Some("x".into()));
        assert_eq!(raw_external_id(&json!({})), None);
    }
}
