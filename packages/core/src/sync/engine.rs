//! Sync cycle driver.
//!
//! A cycle walks the partner listing page by page: fetch, map, upsert,
//! notify. Records are committed one at a time, so a cycle can stop between
//! pages (cancellation, budgets) without leaving partial state behind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};

use crate::metrics::AppMetrics;
use crate::repository::{ExamStore, UpsertOutcome};
use crate::schema::FieldTier;
use crate::sync::error::{ErrorClass, SyncError};
use crate::sync::mapper::{map_partner_exam, raw_external_id};
use crate::sync::provider::ExamSource;

/// Bounds for a single sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub page_size: u32,
    pub max_pages: u32,
    /// Recorded errors after which the cycle stops early.
    pub max_errors: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 40,
            max_errors: 25,
        }
    }
}

/// Why a cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    PageBudget,
    ErrorBudget,
    Cancelled,
    FetchFailed,
}

/// One failure recorded in a cycle report. `external_id` is `None` for
/// page-level failures and for records without a readable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub external_id: Option<String>,
    pub class: ErrorClass,
    pub message: String,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub total_seen: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errored: usize,
    /// Records stored through the basic-tier retry.
    pub basic_fallbacks: usize,
    pub pages_fetched: u32,
    pub errors: Vec<RecordError>,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            total_seen: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            errored: 0,
            basic_fallbacks: 0,
            pages_fetched: 0,
            errors: Vec::new(),
            stop_reason: StopReason::Exhausted,
            started_at,
            finished_at: started_at,
        }
    }

    fn record_error(&mut self, external_id: Option<String>, err: &SyncError) {
        self.errors.push(RecordError {
            external_id,
            class: err.class(),
            message: err.to_string(),
        });
    }
}

/// Emitted for every exam a cycle created or updated.
#[derive(Debug, Clone, PartialEq)]
pub struct ExamSynced {
    pub exam_id: i64,
    pub external_id: String,
    pub outcome: UpsertOutcome,
}

struct RecordSynced {
    external_id: String,
    outcome: UpsertOutcome,
    fell_back: bool,
}

pub struct SyncEngine {
    source: Arc<dyn ExamSource + Send + Sync>,
    store: Arc<dyn ExamStore>,
    config: SyncConfig,
    events: Option<mpsc::Sender<ExamSynced>>,
    cancel: Option<watch::Receiver<bool>>,
    metrics: Option<Arc<AppMetrics>>,
    /// Serializes cycles started concurrently on the same engine.
    cycle_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn ExamSource + Send + Sync>,
        store: Arc<dyn ExamStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
            events: None,
            cancel: None,
            metrics: None,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Publish [`ExamSynced`] events on `sender`.
    pub fn with_events(mut self, sender: mpsc::Sender<ExamSynced>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Stop between pages once `cancel` turns `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> SyncConfig {
        self.config
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Run one sync cycle.
    ///
    /// Per-record and per-page failures are accumulated in the report.
    /// Only an authorization failure aborts the cycle with `Err`.
    pub async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.cycle_lock.lock().await;

        let page_size = self.config.page_size.max(1);
        let mut report = SyncReport::new(Utc::now());
        let mut offset: u32 = 0;
        let mut pages_attempted: u32 = 0;
        let mut total: Option<u64> = None;

        tracing::info!(
            "Sync cycle started (source: {}, page size: {})",
            self.source.source_name(),
            page_size
        );

        let stop_reason = 'pages: loop {
            if self.is_cancelled() {
                break StopReason::Cancelled;
            }
            if pages_attempted >= self.config.max_pages {
                break StopReason::PageBudget;
            }
            pages_attempted += 1;

            let page = match self.source.fetch_exam_page(offset, page_size).await {
                Ok(page) => page,
                Err(err) => {
                    let err = SyncError::from(err);
                    if let SyncError::Unauthorized { .. } = err {
                        return Err(self.abort(err));
                    }
                    tracing::warn!("Page at offset {} failed: {}", offset, err);
                    report.record_error(None, &err);
                    if report.errors.len() >= self.config.max_errors {
                        break StopReason::ErrorBudget;
                    }
                    match total {
                        Some(total) if u64::from(offset) + u64::from(page_size) < total => {
                            offset += page_size;
                            continue;
                        }
                        _ => break StopReason::FetchFailed,
                    }
                }
            };

            report.pages_fetched += 1;
            if page.total.is_some() {
                total = page.total;
            }
            let received = page.exams.len();

            for raw in &page.exams {
                report.total_seen += 1;
                match self.sync_record(raw).await {
                    Ok(synced) => self.count_synced(&mut report, synced).await,
                    Err(err @ SyncError::Unauthorized { .. }) => return Err(self.abort(err)),
                    Err(err) => {
                        let external_id = raw_external_id(raw);
                        tracing::warn!(
                            "Exam {} not synced: {}",
                            external_id.as_deref().unwrap_or("<unknown>"),
                            err
                        );
                        report.errored += 1;
                        report.record_error(external_id, &err);
                        if let Some(m) = &self.metrics {
                            m.sync_record_errors_total.inc();
                        }
                    }
                }
                if report.errors.len() >= self.config.max_errors {
                    break 'pages StopReason::ErrorBudget;
                }
            }

            if received < page_size as usize {
                break StopReason::Exhausted;
            }
            offset += page_size;
            if matches!(total, Some(total) if u64::from(offset) >= total) {
                break StopReason::Exhausted;
            }
        };

        report.stop_reason = stop_reason;
        report.finished_at = Utc::now();
        if let Some(m) = &self.metrics {
            m.sync_cycles_total.inc();
        }

        tracing::info!(
            "Sync cycle finished ({:?}): {} seen, {} created, {} updated, {} unchanged, {} errored, {} basic fallbacks",
            report.stop_reason,
            report.total_seen,
            report.created,
            report.updated,
            report.unchanged,
            report.errored,
            report.basic_fallbacks,
        );
        Ok(report)
    }

    fn abort(&self, err: SyncError) -> SyncError {
        tracing::error!("Sync cycle aborted: {}", err);
        if let Some(m) = &self.metrics {
            m.sync_cycles_total.inc();
        }
        err
    }

    /// Map and store one record, retrying with the basic tier when the
    /// store lacks an extended column.
    async fn sync_record(&self, raw: &Value) -> Result<RecordSynced, SyncError> {
        let exam = map_partner_exam(raw)?;

        let (outcome, fell_back) = match self.store.upsert_exam(&exam, FieldTier::Extended).await {
            Ok(outcome) => (outcome, false),
            Err(err) => {
                let err = SyncError::from(err);
                if !err.is_recoverable_drift() {
                    return Err(err);
                }
                tracing::debug!("Exam {}: {}; retrying with basic fields", exam.external_id, err);
                let outcome = self.store.upsert_exam(&exam, FieldTier::Basic).await?;
                (outcome, true)
            }
        };

        Ok(RecordSynced {
            external_id: exam.external_id,
            outcome,
            fell_back,
        })
    }

    async fn count_synced(&self, report: &mut SyncReport, synced: RecordSynced) {
        if synced.fell_back {
            report.basic_fallbacks += 1;
            if let Some(m) = &self.metrics {
                m.basic_fallbacks_total.inc();
            }
        }

        match synced.outcome {
            UpsertOutcome::Created { .. } => {
                report.created += 1;
                if let Some(m) = &self.metrics {
                    m.exams_created_total.inc();
                }
            }
            UpsertOutcome::Updated { .. } => {
                report.updated += 1;
                if let Some(m) = &self.metrics {
                    m.exams_updated_total.inc();
                }
            }
            UpsertOutcome::Unchanged { .. } => {
                report.unchanged += 1;
                if let Some(m) = &self.metrics {
                    m.exams_unchanged_total.inc();
                }
                return;
            }
        }

        if let Some(sender) = &self.events {
            let event = ExamSynced {
                exam_id: synced.outcome.id(),
                external_id: synced.external_id,
                outcome: synced.outcome,
            };
            if sender.send(event).await.is_err() {
                tracing::debug!("No listener for sync events; dropping notification");
            }
        }
    }
}
