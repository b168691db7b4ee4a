//! Clinical data model and the pure calculations derived from it.
//!
//! Nothing in here performs I/O. The sync and alert engines call into
//! these functions so derived values stay reproducible across reports.

pub mod comparison;
pub mod indices;
pub mod types;

pub use comparison::{
    compare_metrics, first_and_last_exam, improvement_percentage, worst_and_best_exam,
    ComparedMetric, ExamSpan, MetricComparison,
};
pub use indices::{adherence_percentage, adiposity_index, round2, snoring_score};
pub use types::{Exam, ExamType, NewPatient, Patient};
