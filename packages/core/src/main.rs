use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use dotenvy::dotenv;
use tokio::signal;
use tokio::sync::{mpsc, watch};

use sleep_exam_tracker::alerts::AlertEngine;
use sleep_exam_tracker::api::{self, AppState};
use sleep_exam_tracker::cli::Cli;
use sleep_exam_tracker::config::Config;
use sleep_exam_tracker::db;
use sleep_exam_tracker::error::AppError;
use sleep_exam_tracker::logging::init_logging;
use sleep_exam_tracker::metrics::AppMetrics;
use sleep_exam_tracker::repository::ClinicalRepository;
use sleep_exam_tracker::scheduler::{run_retention_schedule, run_sync_schedule};
use sleep_exam_tracker::services::partner::PartnerClient;
use sleep_exam_tracker::sync::SyncEngine;

/// Pending sync notifications buffered before the sync engine waits on
/// the alert listener.
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    if let Err(err) = run(Cli::parse()).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = Config::from_env().map_err(AppError::Config)?;
    config.apply_cli(&cli).map_err(AppError::Config)?;
    tracing::info!("Service starting with config: {:?}", config);

    let pool = db::create_pool_with_schema(&config.database_url, config.schema_level)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;
    let repository = Arc::new(ClinicalRepository::new(pool));
    let metrics = Arc::new(AppMetrics::new().map_err(|e| AppError::Unknown(e.to_string()))?);

    let partner = Arc::new(
        PartnerClient::new(config.partner_settings()).map_err(|e| AppError::Network(e.to_string()))?,
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_engine = Arc::new(
        SyncEngine::new(partner, repository.clone(), config.sync_config())
            .with_events(events_tx)
            .with_cancel(shutdown_rx.clone())
            .with_metrics(metrics.clone()),
    );
    let alert_engine = Arc::new(
        AlertEngine::new(repository.clone(), repository.clone())
            .with_retention(Duration::days(config.alert_retention_days))
            .with_metrics(metrics.clone()),
    );

    let listener = {
        let alerts = alert_engine.clone();
        tokio::spawn(async move { alerts.process_sync_events(events_rx).await })
    };

    if cli.run_once {
        let sync_report = sync_engine.run_cycle().await?;
        // Closing the event channel lets the listener drain and finish.
        drop(sync_engine);
        let _ = listener.await;
        let retention_report = alert_engine.run_retention_sweep(Utc::now()).await?;

        let output = serde_json::json!({
            "sync": sync_report,
            "retention": retention_report,
        });
        let rendered = serde_json::to_string_pretty(&output).map_err(|e| AppError::Parse(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }

    let sync_task = tokio::spawn(run_sync_schedule(
        sync_engine.clone(),
        config.sync_interval_seconds,
        shutdown_rx.clone(),
    ));
    let retention_task = tokio::spawn(run_retention_schedule(
        alert_engine.clone(),
        config.retention_interval_seconds,
        shutdown_rx,
    ));

    let app = api::create_router(AppState {
        exams: repository,
        sync: sync_engine,
        alerts: alert_engine,
        metrics,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let tcp = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Network(format!("cannot bind {}: {}", addr, e)))?;
    tracing::info!("HTTP API listening on {}", addr);

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| AppError::Network(e.to_string()))?;

    let _ = tokio::join!(sync_task, retention_task);
    let _ = listener.await;
    tracing::info!("Service stopped cleanly");
    Ok(())
}

/// Wait for Ctrl+C, then tell the schedules (and any in-flight sync cycle)
/// to stop.
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
    tracing::info!("Shutdown signal received");
    let _ = shutdown.send(true);
}
