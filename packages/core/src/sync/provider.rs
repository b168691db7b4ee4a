//! Exam Source Interface
//!
//! Abstraction over where exam pages come from, so the sync engine does not
//! depend on the partner's HTTP client directly.

use async_trait::async_trait;
use serde_json::Value;

use crate::services::partner::PartnerError;

/// One page of raw partner exam objects.
///
/// Exams are kept as raw JSON so that a single malformed object is a
/// per-record error rather than a failure of the whole page.
#[derive(Debug, Clone, Default)]
pub struct ExamPage {
    /// Total number of exams on the partner side, when reported.
    pub total: Option<u64>,
    pub exams: Vec<Value>,
}

/// Trait for exam sources to keep the sync engine source-independent.
#[async_trait]
pub trait ExamSource {
    /// Fetch up to `limit` exams starting at `offset`. Fewer than `limit`
    /// exams means the end of the data was reached.
    async fn fetch_exam_page(&self, offset: u32, limit: u32) -> Result<ExamPage, PartnerError>;

    /// Get the name of this source for logging/debugging
    fn source_name(&self) -> &str;
}
