//! Prometheus metrics registry for the sleep exam tracker.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and hand it to
//! the sync engine, the alert engine and the HTTP middleware.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Sync cycles run, including aborted ones.
    pub sync_cycles_total: Counter,
    /// Records (or pages) a sync cycle failed to store.
    pub sync_record_errors_total: Counter,
    pub exams_created_total: Counter,
    pub exams_updated_total: Counter,
    pub exams_unchanged_total: Counter,
    /// Records stored with the basic tier after an extended write failed.
    pub basic_fallbacks_total: Counter,
    pub alerts_created_total: Counter,
    /// Resolved alerts removed by the retention sweep.
    pub alerts_deleted_total: Counter,
    /// HTTP request count, labelled by method, path, and status code.
    pub http_requests_total: CounterVec,
    /// HTTP request latency histogram in seconds.
    pub http_request_duration: Histogram,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

fn counter(name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    Counter::with_opts(Opts::new(format!("sleep_exam_tracker_{}", name), help))
}

impl AppMetrics {
    /// Create and register all metrics. Returns an error if any metric
    /// name is invalid or duplicated.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sync_cycles_total = counter("sync_cycles_total", "Sync cycles run")?;
        let sync_record_errors_total =
            counter("sync_record_errors_total", "Exam records that failed to sync")?;
        let exams_created_total = counter("exams_created_total", "Exams inserted by sync")?;
        let exams_updated_total = counter("exams_updated_total", "Exams updated by sync")?;
        let exams_unchanged_total =
            counter("exams_unchanged_total", "Exams skipped because nothing changed")?;
        let basic_fallbacks_total =
            counter("basic_fallbacks_total", "Exams stored with basic fields only")?;
        let alerts_created_total = counter("alerts_created_total", "Alerts raised by rules")?;
        let alerts_deleted_total =
            counter("alerts_deleted_total", "Resolved alerts removed by retention")?;

        let http_requests_total = CounterVec::new(
            Opts::new(
                "sleep_exam_tracker_http_requests_total",
                "HTTP requests by method, path, and status",
            ),
            &["method", "path", "status"],
        )?;

        let http_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "sleep_exam_tracker_http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        for c in [
            &sync_cycles_total,
            &sync_record_errors_total,
            &exams_created_total,
            &exams_updated_total,
            &exams_unchanged_total,
            &basic_fallbacks_total,
            &alerts_created_total,
            &alerts_deleted_total,
        ] {
            registry.register(Box::new(c.clone()))?;
        }
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            sync_cycles_total,
            sync_record_errors_total,
            exams_created_total,
            exams_updated_total,
            exams_unchanged_total,
            basic_fallbacks_total,
            alerts_created_total,
            alerts_deleted_total,
            http_requests_total,
            http_request_duration,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
