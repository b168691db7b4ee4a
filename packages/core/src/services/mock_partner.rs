//! In-memory exam source.
//!
//! Serves a fixed list of raw partner exam objects with offset/limit
//! semantics. Used by tests and by `--run-once` dry runs against canned
//! data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::services::partner::PartnerError;
use crate::sync::provider::{ExamPage, ExamSource};

#[derive(Default)]
pub struct MockPartnerClient {
    exams: Vec<Value>,
    /// Errors returned for specific offsets instead of a page.
    page_errors: Mutex<HashMap<u32, PartnerError>>,
    calls: AtomicUsize,
}

impl MockPartnerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exams(mut self, exams: Vec<Value>) -> Self {
        self.exams = exams;
        self
    }

    /// Fail the page starting at `offset` with `error`.
    pub fn with_page_error(self, offset: u32, error: PartnerError) -> Self {
        if let Ok(mut errors) = self.page_errors.lock() {
            errors.insert(offset, error);
        }
        self
    }

    /// Number of page requests served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExamSource for MockPartnerClient {
    async fn fetch_exam_page(&self, offset: u32, limit: u32) -> Result<ExamPage, PartnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self
            .page_errors
            .lock()
            .ok()
            .and_then(|errors| errors.get(&offset).cloned())
        {
            return Err(err);
        }

        let exams = self
            .exams
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(ExamPage {
            total: Some(self.exams.len() as u64),
            exams,
        })
    }

    fn source_name(&self) -> &str {
        "mock-partner"
    }
}
