//! Scheduled triggers.
//!
//! The sync cycle and the retention sweep run as two independent loops
//! with their own intervals. Neither shares state with the other beyond
//! the record store, so they can overlap freely.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time;

use crate::alerts::{AlertEngine, RetentionReport};
use crate::sync::{SyncEngine, SyncError, SyncReport};

/// Run sync cycles every `interval_seconds` until `shutdown` flips to
/// `true` (or its sender is dropped).
///
/// A failed cycle is logged and the loop continues; the next tick retries
/// from scratch.
pub async fn run_sync_schedule(
    engine: Arc<SyncEngine>,
    interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(Duration::from_secs(interval_seconds.max(1)));
    tracing::info!("Sync schedule started (interval: {}s)", interval_seconds);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {
                let _ = sync_once(&engine).await;
            }
            _ = shutdown.changed() => {
                tracing::info!("Shutdown signal received. Stopping sync schedule.");
                break;
            }
        }
    }

    tracing::info!("Sync schedule stopped cleanly");
}

/// Run retention sweeps every `interval_seconds` until shutdown.
pub async fn run_retention_schedule(
    engine: Arc<AlertEngine>,
    interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(Duration::from_secs(interval_seconds.max(1)));
    tracing::info!("Retention schedule started (interval: {}s)", interval_seconds);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {
                let _ = retention_once(&engine).await;
            }
            _ = shutdown.changed() => {
                tracing::info!("Shutdown signal received. Stopping retention schedule.");
                break;
            }
        }
    }

    tracing::info!("Retention schedule stopped cleanly");
}

/// One scheduled sync cycle. Extracted for testability.
pub async fn sync_once(engine: &SyncEngine) -> Result<SyncReport, SyncError> {
    let result = engine.run_cycle().await;
    if let Err(err) = &result {
        tracing::error!("Scheduled sync failed: {}", err);
    }
    result
}

/// One scheduled retention sweep.
pub async fn retention_once(engine: &AlertEngine) -> Option<RetentionReport> {
    match engine.run_retention_sweep(Utc::now()).await {
        Ok(report) => Some(report),
        Err(err) => {
            tracing::error!("Scheduled retention sweep failed: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::db::create_pool;
    use crate::repository::ClinicalRepository;
    use crate::services::mock_partner::MockPartnerClient;
    use crate::services::partner::PartnerError;
    use crate::sync::SyncConfig;

    async fn make_repo() -> Arc<ClinicalRepository> {
        Arc::new(ClinicalRepository::new(create_pool("sqlite::memory:").await.unwrap()))
    }

    fn make_sync(repo: Arc<ClinicalRepository>, source: MockPartnerClient) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(Arc::new(source), repo, SyncConfig::default()))
    }

    fn exam(id: &str) -> serde_json::Value {
        json!({ "examId": id, "type": "SNORING", "status": "DONE", "examDate": "2024-05-01" })
    }

    #[tokio::test]
    async fn sync_once_returns_cycle_report() {
        let repo = make_repo().await;
        let engine = make_sync(repo, MockPartnerClient::new().with_exams(vec![exam("A"), exam("B")]));

        let report = sync_once(&engine).await.unwrap();

        assert_eq!(report.created, 2);
    }

    #[tokio::test]
    async fn sync_once_surfaces_authorization_failure() {
        let repo = make_repo().await;
        let source = MockPartnerClient::new()
            .with_page_error(0, PartnerError::Unauthorized { message: "expired".into() });
        let engine = make_sync(repo, source);

        assert!(sync_once(&engine).await.is_err());
    }

    #[tokio::test]
    async fn retention_once_reports_zero_on_empty_store() {
        let repo = make_repo().await;
        let engine = AlertEngine::new(repo.clone(), repo);

        let report = retention_once(&engine).await.unwrap();

        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn sync_schedule_runs_first_tick_and_stops_on_shutdown() {
        let repo = make_repo().await;
        let source = Arc::new(MockPartnerClient::new().with_exams(vec![exam("A")]));
        let engine = Arc::new(SyncEngine::new(source.clone(), repo, SyncConfig::default()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_sync_schedule(engine, 3600, rx));
        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();

        handle.await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn retention_schedule_exits_when_sender_dropped() {
        let repo = make_repo().await;
        let engine = Arc::new(AlertEngine::new(repo.clone(), repo));
        let (tx, rx) = watch::channel(false);
        drop(tx);

        // changed() errors once the sender is gone, ending the loop.
        run_retention_schedule(engine, 60, rx).await;
    }
}
