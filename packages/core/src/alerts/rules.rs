//! Threshold rules evaluated against a freshly synced exam.
//!
//! The table is fixed and ordered. A rule whose inputs are missing simply
//! does not fire; it is never an error.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::alerts::types::{AlertType, AlertUrgency, NewAlert};
use crate::clinical::{improvement_percentage, Exam, ExamType, Patient};

/// Cutoffs used by the rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Apnea index (events/h) at or above which apnea is severe.
    pub severe_apnea_index: f64,
    /// Minimum SpO2 (%) below which desaturation is critical.
    pub critical_spo2_min: f64,
    /// Improvement percentage at or below which a metric has worsened.
    pub worsening_pct: f64,
    pub min_sleep_efficiency: f64,
    pub min_adherence_pct: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            severe_apnea_index: 30.0,
            critical_spo2_min: 80.0,
            worsening_pct: -20.0,
            min_sleep_efficiency: 85.0,
            min_adherence_pct: 70.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertRule {
    SevereApnea,
    CriticalDesaturation,
    AtrialFibrillation,
    ApneaWorsening,
    SnoringWorsening,
    LowSleepEfficiency,
    LowTherapyAdherence,
}

/// Evaluation order.
pub const ALERT_RULES: [AlertRule; 7] = [
    AlertRule::SevereApnea,
    AlertRule::CriticalDesaturation,
    AlertRule::AtrialFibrillation,
    AlertRule::ApneaWorsening,
    AlertRule::SnoringWorsening,
    AlertRule::LowSleepEfficiency,
    AlertRule::LowTherapyAdherence,
];

/// What a rule gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub exam: &'a Exam,
    /// The patient's previous exam of the same type, if any.
    pub previous: Option<&'a Exam>,
    pub patient: Option<&'a Patient>,
}

impl AlertRule {
    pub fn key(&self) -> &'static str {
        match self {
            AlertRule::SevereApnea => "severe_apnea",
            AlertRule::CriticalDesaturation => "critical_desaturation",
            AlertRule::AtrialFibrillation => "atrial_fibrillation",
            AlertRule::ApneaWorsening => "apnea_worsening",
            AlertRule::SnoringWorsening => "snoring_worsening",
            AlertRule::LowSleepEfficiency => "low_sleep_efficiency",
            AlertRule::LowTherapyAdherence => "low_therapy_adherence",
        }
    }

    pub fn alert_type(&self) -> AlertType {
        match self {
            AlertRule::SevereApnea | AlertRule::CriticalDesaturation | AlertRule::AtrialFibrillation => {
                AlertType::Critical
            }
            AlertRule::ApneaWorsening | AlertRule::SnoringWorsening | AlertRule::LowSleepEfficiency => {
                AlertType::FollowUp
            }
            AlertRule::LowTherapyAdherence => AlertType::Maintenance,
        }
    }

    pub fn urgency(&self) -> AlertUrgency {
        match self {
            AlertRule::SevereApnea | AlertRule::CriticalDesaturation | AlertRule::AtrialFibrillation => {
                AlertUrgency::High
            }
            AlertRule::ApneaWorsening | AlertRule::LowTherapyAdherence => AlertUrgency::Medium,
            AlertRule::SnoringWorsening | AlertRule::LowSleepEfficiency => AlertUrgency::Low,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AlertRule::SevereApnea => "Severe sleep apnea",
            AlertRule::CriticalDesaturation => "Critical oxygen desaturation",
            AlertRule::AtrialFibrillation => "Atrial fibrillation detected",
            AlertRule::ApneaWorsening => "Apnea index worsened",
            AlertRule::SnoringWorsening => "Snoring worsened",
            AlertRule::LowSleepEfficiency => "Low sleep efficiency",
            AlertRule::LowTherapyAdherence => "Low therapy adherence",
        }
    }

    /// Patient-level rules are not tied to a single exam.
    pub fn is_patient_level(&self) -> bool {
        matches!(self, AlertRule::LowTherapyAdherence)
    }

    /// Evaluate this rule. `None` when it does not fire or lacks inputs.
    pub fn evaluate(&self, ctx: &RuleContext<'_>, thresholds: &RuleThresholds) -> Option<NewAlert> {
        let exam = ctx.exam;

        let (message, payload) = match self {
            AlertRule::SevereApnea => {
                if !exam.is_sleep() {
                    return None;
                }
                let ido = exam.apnea_index?;
                if ido < thresholds.severe_apnea_index {
                    return None;
                }
                (
                    format!(
                        "Apnea index of {} events/h on exam {} (threshold {})",
                        ido, exam.external_id, thresholds.severe_apnea_index
                    ),
                    json!({ "apnea_index": ido, "threshold": thresholds.severe_apnea_index }),
                )
            }
            AlertRule::CriticalDesaturation => {
                if !exam.is_sleep() {
                    return None;
                }
                let spo2_min = exam.spo2_min?;
                if spo2_min >= thresholds.critical_spo2_min {
                    return None;
                }
                (
                    format!(
                        "Minimum SpO2 of {}% on exam {} (threshold {}%)",
                        spo2_min, exam.external_id, thresholds.critical_spo2_min
                    ),
                    json!({ "spo2_min": spo2_min, "threshold": thresholds.critical_spo2_min }),
                )
            }
            AlertRule::AtrialFibrillation => {
                if exam.af_detected != Some(true) {
                    return None;
                }
                (
                    format!("Atrial fibrillation flagged on exam {}", exam.external_id),
                    json!({ "af_detected": true }),
                )
            }
            AlertRule::ApneaWorsening => {
                worsening(exam, ctx.previous?, ExamType::Sleep, |e| e.apnea_index, "apnea_index", thresholds)?
            }
            AlertRule::SnoringWorsening => {
                worsening(exam, ctx.previous?, ExamType::Snoring, |e| e.snoring_score, "snoring_score", thresholds)?
            }
            AlertRule::LowSleepEfficiency => {
                let efficiency = exam.sleep_efficiency?;
                if efficiency >= thresholds.min_sleep_efficiency {
                    return None;
                }
                (
                    format!(
                        "Sleep efficiency of {}% on exam {} (target {}%)",
                        efficiency, exam.external_id, thresholds.min_sleep_efficiency
                    ),
                    json!({ "sleep_efficiency": efficiency, "threshold": thresholds.min_sleep_efficiency }),
                )
            }
            AlertRule::LowTherapyAdherence => {
                let patient = ctx.patient?;
                let adherence = patient.adherence_percentage()?;
                if adherence >= thresholds.min_adherence_pct {
                    return None;
                }
                (
                    format!(
                        "Therapy adherence of {}% for {} (target {}%)",
                        adherence, patient.name, thresholds.min_adherence_pct
                    ),
                    json!({
                        "adherence_pct": adherence,
                        "sessions_used": patient.therapy_sessions_used,
                        "sessions_prescribed": patient.therapy_sessions_prescribed,
                        "threshold": thresholds.min_adherence_pct,
                    }),
                )
            }
        };

        let patient_id = exam.patient_id.or(ctx.patient.map(|p| p.id));
        if self.is_patient_level() && patient_id.is_none() {
            return None;
        }

        Some(NewAlert {
            alert_type: self.alert_type(),
            urgency: self.urgency(),
            title: self.title().to_string(),
            message,
            patient_id,
            exam_id: if self.is_patient_level() { None } else { exam.id },
            rule_key: self.key().to_string(),
            payload,
        })
    }
}

fn worsening(
    exam: &Exam,
    previous: &Exam,
    exam_type: ExamType,
    metric: fn(&Exam) -> Option<f64>,
    field: &str,
    thresholds: &RuleThresholds,
) -> Option<(String, serde_json::Value)> {
    if exam.exam_type != exam_type || previous.exam_type != exam_type {
        return None;
    }
    let before = metric(previous)?;
    let after = metric(exam)?;
    let change = improvement_percentage(Some(before), Some(after), true)?;
    if change > thresholds.worsening_pct {
        return None;
    }

    Some((
        format!(
            "{} went from {} to {} ({}%) since exam {}",
            field, before, after, change, previous.external_id
        ),
        json!({
            "field": field,
            "previous_value": before,
            "current_value": after,
            "improvement_pct": change,
            "previous_exam": previous.external_id,
            "threshold": thresholds.worsening_pct,
        }),
    ))
}

/// Evaluate every rule in table order and collect the alerts that fire.
pub fn evaluate_all(ctx: &RuleContext<'_>, thresholds: &RuleThresholds) -> Vec<NewAlert> {
    ALERT_RULES
        .iter()
        .filter_map(|rule| rule.evaluate(ctx, thresholds))
        .collect()
}
