//! Inter-exam comparison.
//!
//! Given exam snapshots of the same patient, works out which metrics
//! improved or worsened and by how much, honouring each metric's
//! polarity ("lower is better" vs "higher is better").

use serde::{Deserialize, Serialize};

use crate::clinical::indices::round2;
use crate::clinical::types::{Exam, ExamType};

/// Metrics that can be compared between two exams of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparedMetric {
    /// Apnea index (IDO), events per hour.
    ApneaIndex,
    MinimumSpo2,
    /// Share of recording time spent below 90% SpO2.
    TimeBelow90Pct,
    SnoringScore,
    HypoxicBurden,
}

/// Fixed metric table, in output order.
pub const COMPARED_METRICS: [ComparedMetric; 5] = [
    ComparedMetric::ApneaIndex,
    ComparedMetric::MinimumSpo2,
    ComparedMetric::TimeBelow90Pct,
    ComparedMetric::SnoringScore,
    ComparedMetric::HypoxicBurden,
];

impl ComparedMetric {
    pub fn name(&self) -> &'static str {
        match self {
            ComparedMetric::ApneaIndex => "ido",
            ComparedMetric::MinimumSpo2 => "spo2_min",
            ComparedMetric::TimeBelow90Pct => "time_below_90_pct",
            ComparedMetric::SnoringScore => "snoring_score",
            ComparedMetric::HypoxicBurden => "hypoxic_burden",
        }
    }

    pub fn lower_is_better(&self) -> bool {
        !matches!(self, ComparedMetric::MinimumSpo2)
    }

    /// The only exam type this metric is defined for.
    pub fn exam_type(&self) -> ExamType {
        match self {
            ComparedMetric::SnoringScore => ExamType::Snoring,
            _ => ExamType::Sleep,
        }
    }

    /// Extract the metric from an exam, or `None` when its raw fields are
    /// missing.
    pub fn value(&self, exam: &Exam) -> Option<f64> {
        match self {
            ComparedMetric::ApneaIndex => exam.apnea_index,
            ComparedMetric::MinimumSpo2 => exam.spo2_min,
            ComparedMetric::TimeBelow90Pct => {
                let below = exam.time_below_90_s?;
                let total = exam.duration_s?;
                if below <= 0.0 || total <= 0.0 {
                    return None;
                }
                Some(round2(below / total * 100.0))
            }
            ComparedMetric::SnoringScore => exam.snoring_score,
            ComparedMetric::HypoxicBurden => exam.hypoxic_burden,
        }
    }
}

/// One row of a two-exam comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric: ComparedMetric,
    pub initial_value: f64,
    pub final_value: f64,
    pub delta: f64,
    pub improvement_percentage: Option<f64>,
    pub improved: bool,
    pub lower_is_better: bool,
}

/// A pair of exams picked out of a history (first/last or worst/best).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExamSpan<'a> {
    pub first: Option<&'a Exam>,
    pub last: Option<&'a Exam>,
}

/// Relative improvement from `initial` to `final_value`, in percent.
///
/// A zero baseline cannot be divided by: staying at zero is 0%, moving
/// away from zero is -100% for lower-is-better metrics and +100% for
/// higher-is-better ones.
pub fn improvement_percentage(
    initial: Option<f64>,
    final_value: Option<f64>,
    lower_is_better: bool,
) -> Option<f64> {
    let initial = initial?;
    let final_value = final_value?;

    if initial == 0.0 {
        if final_value == 0.0 {
            return Some(0.0);
        }
        return Some(if lower_is_better { -100.0 } else { 100.0 });
    }

    let change = if lower_is_better {
        (initial - final_value) / initial * 100.0
    } else {
        (final_value - initial) / initial * 100.0
    };
    Some(round2(change))
}

/// First and last exam of a date-sorted history. Both are the same exam
/// when the history has a single entry.
pub fn first_and_last_exam(exams_sorted_by_date: &[Exam]) -> ExamSpan<'_> {
    ExamSpan {
        first: exams_sorted_by_date.first(),
        last: exams_sorted_by_date.last(),
    }
}

/// Worst (highest apnea index) and best (lowest) sleep exam.
///
/// `first` holds the worst exam and `last` the best. Only sleep exams with
/// an apnea index qualify. On ties the first occurrence in iteration order
/// wins; this is observable and must be confirmed with the clinical team
/// before it changes.
pub fn worst_and_best_exam(exams: &[Exam]) -> ExamSpan<'_> {
    let mut worst: Option<(&Exam, f64)> = None;
    let mut best: Option<(&Exam, f64)> = None;

    for exam in exams.iter().filter(|e| e.is_sleep()) {
        let Some(index) = exam.apnea_index else { continue };

        if worst.map_or(true, |(_, w)| index > w) {
            worst = Some((exam, index));
        }
        if best.map_or(true, |(_, b)| index < b) {
            best = Some((exam, index));
        }
    }

    ExamSpan {
        first: worst.map(|(e, _)| e),
        last: best.map(|(e, _)| e),
    }
}

/// Compare every applicable metric between `initial` and `final_exam`.
///
/// Nothing is emitted unless both exams exist and share a type; a metric
/// row is only produced when its raw fields are present on both sides.
pub fn compare_metrics(initial: Option<&Exam>, final_exam: Option<&Exam>) -> Vec<MetricComparison> {
    let (Some(a), Some(b)) = (initial, final_exam) else {
        return Vec::new();
    };
    if a.exam_type != b.exam_type {
        return Vec::new();
    }

    COMPARED_METRICS
        .iter()
        .filter(|metric| metric.exam_type() == a.exam_type)
        .filter_map(|metric| {
            let initial_value = metric.value(a)?;
            let final_value = metric.value(b)?;
            let lower_is_better = metric.lower_is_better();
            let delta = round2(final_value - initial_value);
            let improved = if lower_is_better { delta < 0.0 } else { delta > 0.0 };

            Some(MetricComparison {
                metric: *metric,
                initial_value,
                final_value,
                delta,
                improvement_percentage: improvement_percentage(
                    Some(initial_value),
                    Some(final_value),
                    lower_is_better,
                ),
                improved,
                lower_is_better,
            })
        })
        .collect()
}
